use std::{collections::BTreeMap, io::{self, stdout}, process::ExitCode};

use clap::{Parser, ValueEnum};
use firebase_allowlist_gate::{config::GateConfig, Secret};
use itertools::Itertools;
use serde::Deserialize;

// Doppler renders unset references as this literal
const DOPPLER_NO_VALUE: &str = "<no value>";

#[derive(Deserialize)]
struct DopplerSecret {
  computed: String
}

type Secrets = BTreeMap<String, DopplerSecret>;

#[derive(Parser)]
struct Args {
  #[arg(value_enum)]
  output: Output
}

#[derive(ValueEnum, Clone)]
enum Output {
  /// Output the result in json format
  Json,
  /// Output the result in .env format
  Env,
}

/// Takes Doppler json secrets from stdin, checks they make a valid gate
/// deployment, and outputs either `wrangler secrets` or .env compatible values
fn main() -> ExitCode {
  let Args{ output } = Args::parse();

  let secrets = match serde_json::from_reader::<_, Secrets>(io::stdin().lock()) {
    Ok(secrets) => secrets,
    Err(e) => {
      eprintln!("stdin is not a Doppler json dump: {e}");
      return ExitCode::FAILURE
    }
  };

  let secrets = secrets.into_iter()
    .map(|(k, v)| (k, v.computed))
    .collect::<BTreeMap<String, String>>();

  let unset = secrets.iter()
    .filter(|(_, v)| *v == DOPPLER_NO_VALUE)
    .map(|(k, _)| k)
    .join(", ");
  if !unset.is_empty() {
    eprintln!("unresolved Doppler references: {unset}");
    return ExitCode::FAILURE
  }

  if let Err(e) = GateConfig::from_lookup(|secret: Secret| secrets.get(secret.name()).cloned()) {
    eprintln!("{e}");
    return ExitCode::FAILURE
  }

  match output {
    // json
    Output::Json => if let Err(e) = serde_json::to_writer(stdout(), &secrets) {
      eprintln!("{e}");
      return ExitCode::FAILURE
    },
    // env
    Output::Env => print!(
      "{}",
      secrets.iter()
        .map(|(k, v)| format!("{k}='{v}'"))
        .join("\n")
    )
  }

  ExitCode::SUCCESS
}
