use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let resources = [
        infisical_operator::resources::PulledSecret::crd(),
        infisical_operator::resources::PushedSecret::crd(),
        infisical_operator::resources::DynamicSecret::crd(),
        infisical_operator::resources::ClusterGenerator::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }
    Ok(())
}
