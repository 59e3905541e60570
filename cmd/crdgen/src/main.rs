//! Prints the operator's CRDs as a multi-document YAML stream:
//! `cargo run --bin crdgen | kubectl apply -f -`

use frappeop_operator::crd::backup::{SiteBackup, SiteRestore};
use frappeop_operator::crd::bench::Bench;
use frappeop_operator::crd::site::Site;
use kube::CustomResourceExt;

fn main() {
    for crd in [Bench::crd(), Site::crd(), SiteBackup::crd(), SiteRestore::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd).expect("CRD serializes"));
    }
}
