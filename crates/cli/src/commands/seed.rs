use countersign_core::config::LoadOptions;
use countersign_db::DemoSeedDataset;

use crate::commands::{open_pool, prepare, CommandResult, EXIT_MIGRATION};

pub fn run(options: &LoadOptions) -> CommandResult {
    let (config, runtime) = match prepare("seed", options) {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;

        let seed_result = DemoSeedDataset::load(&pool, &config.sequence.format())
            .await
            .map_err(|error| ("seed_execution", error.to_string(), EXIT_MIGRATION))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), EXIT_MIGRATION))?;

        let run_result: Result<SeedOutput, (&'static str, String, u8)> =
            if !verification.all_present {
                let failed_checks = verification
                    .checks
                    .iter()
                    .filter_map(|(check, passed)| (!passed).then_some(*check))
                    .collect::<Vec<_>>();
                Err(("seed_verification", verification_message(&failed_checks), EXIT_MIGRATION))
            } else {
                Ok(SeedOutput { users: seed_result.users, categories: seed_result.categories })
            };

        pool.close().await;
        run_result
    });

    match result {
        Ok(output) => {
            let category_lines: Vec<String> =
                output.categories.iter().map(|name| format!("  - {name}")).collect();
            let message = format!(
                "demo dataset loaded: {} users and {} approval categories:\n{}",
                output.users,
                output.categories.len(),
                category_lines.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

struct SeedOutput {
    users: usize,
    categories: Vec<&'static str>,
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
