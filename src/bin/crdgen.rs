use kube::CustomResourceExt;
use vault_config_operator::crd::{
    DatabaseSecretEngineRole, DatabaseSecretEngineStaticRole, KubernetesAuthEngineRole,
};

fn main() -> anyhow::Result<()> {
    let crds = [
        DatabaseSecretEngineStaticRole::crd(),
        DatabaseSecretEngineRole::crd(),
        KubernetesAuthEngineRole::crd(),
    ];

    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", documents.join("---\n"));
    Ok(())
}
