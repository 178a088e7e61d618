use std::io::{self, Write};

use crate::probe::Outcome;

pub const START_BANNER: &str = "Running the AKS workload identity check.";
pub const END_BANNER: &str = "AKS workload identity check finished.";

/// Writes the check results for the operator.
///
/// Values go to `out`, warnings go to `err`. Warnings are written directly
/// rather than logged so that a restrictive `RUST_LOG` cannot hide them.
pub struct Reporter<W, E> {
    out: W,
    err: E,
}

impl<W: Write, E: Write> Reporter<W, E> {
    pub fn new(out: W, err: E) -> Self {
        Self { out, err }
    }

    pub fn start(&mut self) -> io::Result<()> {
        writeln!(self.out, "{}", START_BANNER)
    }

    pub fn finish(&mut self, outcome: &Outcome) -> io::Result<()> {
        match outcome {
            Outcome::Verified {
                subscription_id,
                principal_id,
                ..
            } => {
                writeln!(self.out, "Subscription ID: {}", subscription_id)?;
                writeln!(self.out, "Principal ID (Managed Identity): {}", principal_id)?;
            }
            Outcome::PrincipalDenied {
                subscription_id, ..
            } => {
                writeln!(self.out, "Subscription ID: {}", subscription_id)?;
            }
            Outcome::SubscriptionDenied { .. } => {}
        }

        let warnings = outcome.warnings();
        for warning in &warnings {
            writeln!(self.err, "[WARN] {}", warning.problem)?;
            writeln!(self.err, "[WARN] {}", warning.remedy)?;
        }
        self.err.flush()?;
        if !warnings.is_empty() {
            writeln!(
                self.out,
                "Workload identity check finished with warnings (see standard error)."
            )?;
        }

        writeln!(self.out, "{}", END_BANNER)?;
        self.out.flush()
    }

    pub fn into_inner(self) -> (W, E) {
        (self.out, self.err)
    }
}
