use signoff_core::config::{AppConfig, LoadOptions};
use signoff_core::eligibility::InMemoryDirectory;
use signoff_core::routing::ConfigurationFile;
use signoff_db::connect_with_config;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 3] = ["directory_file", "tier_configurations", "database_connectivity"];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_directory(&config));
            checks.push(check_tier_configurations(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    // Optional inputs that are simply unset count as passing.
    let all_pass = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_directory(config: &AppConfig) -> DoctorCheck {
    let Some(path) = &config.engine.directory_path else {
        return DoctorCheck {
            name: "directory_file",
            status: CheckStatus::Skipped,
            details: "engine.directory_path is unset; role and manager approvers resolve to nobody"
                .to_string(),
        };
    };

    match InMemoryDirectory::from_file(path) {
        Ok(directory) => DoctorCheck {
            name: "directory_file",
            status: CheckStatus::Pass,
            details: format!("loaded {} users from `{}`", directory.len(), path.display()),
        },
        Err(error) => {
            DoctorCheck { name: "directory_file", status: CheckStatus::Fail, details: error.to_string() }
        }
    }
}

fn check_tier_configurations(config: &AppConfig) -> DoctorCheck {
    let Some(dir) = &config.engine.configurations_dir else {
        return DoctorCheck {
            name: "tier_configurations",
            status: CheckStatus::Skipped,
            details: "engine.configurations_dir is unset; only stored configurations will load"
                .to_string(),
        };
    };

    match ConfigurationFile::load_dir(dir) {
        Ok(configurations) => DoctorCheck {
            name: "tier_configurations",
            status: CheckStatus::Pass,
            details: format!(
                "{} tier configurations valid in `{}`",
                configurations.len(),
                dir.display()
            ),
        },
        Err(error) => DoctorCheck {
            name: "tier_configurations",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;

        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
