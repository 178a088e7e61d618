use std::{io, process::exit};

use aks_wi_check::{check, connect, CheckError, Reporter};
use clap::Parser;

/// Check that the AKS workload identity of this pod can reach Azure Resource Manager.
///
/// Reads AZURE_CLIENT_ID, AZURE_TENANT_ID and AZURE_FEDERATED_TOKEN_FILE
/// (and optionally AZURE_AUTHORITY_HOST) from the environment.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Cli {}

fn main() {
    Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut reporter = Reporter::new(io::stdout().lock(), io::stderr());
    if let Err(e) = reporter.start() {
        eprintln!("Error: failed to write output: {}", e);
        exit(1);
    }

    match check(connect) {
        Ok(outcome) => {
            if let Err(e) = reporter.finish(&outcome) {
                eprintln!("Error: failed to write output: {}", e);
                exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if let CheckError::MissingEnvironment(_) = e {
                eprintln!(
                    "Verify the azure.workload.identity/use label on the pod and the \
                    azure.workload.identity/client-id annotation on its service account."
                );
            }
            exit(1);
        }
    }
}
