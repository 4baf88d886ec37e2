//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static INGEST_LOG_ENV_VAR: &str = "INGEST_LOG";

/// Initializes a tracing subscriber for logging.
///
/// Workspace crates log at the level given by `INGEST_LOG` (default `info`) unless `RUST_LOG`
/// carries a directive for them; everything else logs errors only.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        // A subscriber installed elsewhere (e.g. by an embedding binary) wins
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init()
            .is_ok();

        if installed {
            tracing::info!("log level: {}", log_level);
        }
    });
}

/// List of crates in the workspace.
const INGEST_CRATES: &[&str] = &[
    "common",
    "config",
    "coordinator",
    "ingest",
    "ingestctl",
    "metadata_db",
    "monitoring",
];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG, dropping the ones that do not parse
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(&directive_string);

    let log_level = std::env::var(INGEST_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in INGEST_CRATES {
        // Add directives for each crate in INGEST_CRATES, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(err) => {
                eprintln!("ignoring invalid {INGEST_LOG_ENV_VAR} value '{log_level}': {err}");
                break;
            }
        }
    }

    (env_filter, log_level)
}

/// Renders the chain of causes below `err`, outermost first, for the `error_source` log field.
///
/// Returns an empty string when the error has no source.
pub fn error_source(err: &(dyn Error + 'static)) -> String {
    let mut sources = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        sources.push(source.to_string());
        current = source.source();
    }

    if sources.is_empty() {
        String::new()
    } else {
        format!("{sources:?}")
    }
}

/// If this fails, just update the above `INGEST_CRATES` to match reality.
#[test]
fn assert_ingest_crates() {
    use cargo_metadata::MetadataCommand;

    let cmd = MetadataCommand::new()
        .exec()
        .expect("Failed to read cargo metadata");
    let mut names: Vec<String> = cmd
        .workspace_packages()
        .into_iter()
        .map(|pkg| pkg.name.replace("-", "_").clone())
        .collect();
    names.sort();
    assert_eq!(names, INGEST_CRATES);
}

#[cfg(test)]
mod tests {
    use super::error_source;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Middle);

    #[derive(Debug, thiserror::Error)]
    #[error("middle")]
    struct Middle(#[source] std::io::Error);

    #[test]
    fn error_source_lists_causes_outermost_first() {
        let err = Outer(Middle(std::io::Error::other("disk on fire")));
        assert_eq!(error_source(&err), r#"["middle", "disk on fire"]"#);
    }

    #[test]
    fn error_source_is_empty_without_causes() {
        let err = std::io::Error::other("plain");
        assert_eq!(error_source(&err), "");
    }
}
