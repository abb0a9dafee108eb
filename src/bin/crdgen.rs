//! CRD YAML Generator
//!
//! This binary generates Kubernetes CRD manifests for all custom resources
//! defined by the dex-operator.
//!
//! Usage: cargo run --bin crdgen > config/crd/bases/auth.identitatem.io_dexservers.yaml

use dex_operator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
