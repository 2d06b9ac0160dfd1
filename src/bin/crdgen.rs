use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let resources = [
        bucket_operator::resources::Bucket::crd(),
        bucket_operator::resources::ClusterBucket::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }

    Ok(())
}
