//! # CRD Generator
//!
//! Generates the CustomResourceDefinition YAML for both resources from the
//! Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > deploy/crds.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;

use nixos_infra_controller::crd::{Machine, NixosConfiguration};

fn print_crd(crd: &k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition) {
    match serde_yaml::to_string(crd) {
        Ok(yaml) => {
            println!("---");
            print!("{yaml}");
        }
        Err(e) => {
            eprintln!("Failed to serialize CRD to YAML: {e}");
            std::process::exit(1);
        }
    }
}

fn main() {
    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# Regenerate with: cargo run --bin crdgen");

    print_crd(&Machine::crd());
    print_crd(&NixosConfiguration::crd());
}
