use std::io;
use std::process::ExitCode;

use clap::Parser;
use iap_id_token::{fetch_id_token, Config, Error, IdToken};
use tracing_subscriber::EnvFilter;

/// Print an OIDC identity token for the IAP protected App Engine app of the current project
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Service account to impersonate instead of using the ambient identity
    #[arg(long, value_name = "EMAIL")]
    target_principal: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    Output::from_result(run(cli).await).emit()
}

async fn run(cli: Cli) -> Result<IdToken, Error> {
    let config = Config::from_env(cli.target_principal)?;
    fetch_id_token(&config).await
}

/// What the process prints, and where
#[derive(Debug, PartialEq, Eq)]
enum Output {
    /// Pretty `{"token": ...}` JSON for stdout
    Token(String),
    /// Pretty error report JSON for stderr
    Failure(String),
}

impl Output {
    fn from_result(result: Result<IdToken, Error>) -> Self {
        let err = match result {
            Ok(token) => match serde_json::to_string_pretty(&token) {
                Ok(json) => return Self::Token(json),
                Err(err) => Error::Json("failed to serialize token", err),
            },
            Err(err) => err,
        };

        let report = err.report();
        Self::Failure(
            serde_json::to_string_pretty(&report)
                .unwrap_or_else(|_| format!("{}: {}", report.title, report.message)),
        )
    }

    fn exit_code(&self) -> u8 {
        match self {
            Self::Token(_) => 0,
            Self::Failure(_) => 1,
        }
    }

    fn emit(self) -> ExitCode {
        let code = self.exit_code();
        match self {
            Self::Token(json) => println!("{json}"),
            Self::Failure(report) => eprintln!("{report}"),
        }
        ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parses_target_principal() {
        let cli = Cli::try_parse_from([
            "iap-id-token",
            "--target-principal",
            "invoker@my-project.iam.gserviceaccount.com",
        ])
        .unwrap();
        assert_eq!(
            cli.target_principal.as_deref(),
            Some("invoker@my-project.iam.gserviceaccount.com")
        );

        let cli = Cli::try_parse_from(["iap-id-token"]).unwrap();
        assert_eq!(cli.target_principal, None);
    }

    #[test]
    fn test_rejects_unknown_flags() {
        let err = Cli::try_parse_from(["iap-id-token", "--bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_version_flag() {
        for flag in ["--version", "-V"] {
            let err = Cli::try_parse_from(["iap-id-token", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        }
    }

    #[test]
    fn test_success_prints_token_json() {
        let token: IdToken =
            serde_json::from_value(json!({ "token": "header.claims.sig" })).unwrap();
        let output = Output::from_result(Ok(token));
        assert_eq!(output.exit_code(), 0);

        let json = match output {
            Output::Token(json) => json,
            other => panic!("expected token output, got {other:?}"),
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&json).unwrap(),
            json!({ "token": "header.claims.sig" })
        );
    }

    #[test]
    fn test_failure_prints_report() {
        let err = Error::IllegalAccess("no managed runtime detected");
        let output = Output::from_result(Err(err));
        assert_eq!(output.exit_code(), 1);

        let report = match output {
            Output::Failure(report) => report,
            other => panic!("expected failure output, got {other:?}"),
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&report).unwrap(),
            json!({
                "type": "illegal-access",
                "title": "Illegal access",
                "message": "no managed runtime detected",
            })
        );
    }
}
