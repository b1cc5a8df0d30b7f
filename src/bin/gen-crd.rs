use kube::CustomResourceExt;
use kubereplay::crd::harvester::Harvester;
use kubereplay::crd::refinery::Refinery;

/// Print the Harvester and Refinery CRDs as a JSON `List` that `kubectl apply -f` accepts
fn main() -> anyhow::Result<()> {
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [Harvester::crd(), Refinery::crd()],
    });
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}
