use neutree_cluster::api::v1::{Cluster, ImageRegistry};
use neutree_cluster::config::{KubernetesClusterConfig, SshClusterConfig};
use schemars::schema_for;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&schema_for!(Cluster))?);
    println!("---");
    print!("{}", serde_yaml::to_string(&schema_for!(ImageRegistry))?);
    println!("---");
    print!("{}", serde_yaml::to_string(&schema_for!(SshClusterConfig))?);
    println!("---");
    print!("{}", serde_yaml::to_string(&schema_for!(KubernetesClusterConfig))?);
    Ok(())
}
