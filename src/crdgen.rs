use kube::CustomResourceExt;
use postgres_access_operator::{PostgresDatabase, PostgresGrant, PostgresRole};

fn main() -> Result<(), serde_yaml::Error> {
    let documents = [
        PostgresRole::crd(),
        PostgresDatabase::crd(),
        PostgresGrant::crd(),
    ];

    for document in documents {
        println!("---");
        print!("{}", serde_yaml::to_string(&document)?);
    }
    Ok(())
}
