use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::admission::AdmissionPolicy;
use crate::error::{Result, SamplerError};
use crate::sampler::CurvePlan;

/// Each slot above the floor costs one sampled draw per refresh.
pub const MAX_TARGET_SAMPLE_COUNT: i64 = 1_000_000;

#[derive(Debug, Clone, Args)]
pub struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Seconds before any single store call is abandoned
    #[arg(long = "db-timeout", env = "DB_TIMEOUT", default_value_t = 30)]
    pub db_timeout: u64,
    #[arg(long, env = "DB_MAX_POOL_SIZE", default_value_t = 5)]
    pub db_max_pool_size: u32,
    #[arg(long, env = "DB_IDLE_CONN_TIMEOUT", default_value_t = 45)]
    pub db_idle_conn_timeout: u64,
}

impl DatabaseArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout.max(1))
    }
}

#[derive(Debug, Clone, Args)]
pub struct SamplerArgs {
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: String,
    /// CSV of historical completion times, minutes in the second column
    #[arg(long, env = "SAMPLE_FILE_PATH")]
    pub sample_file_path: PathBuf,
    #[arg(long, env = "TARGET_SAMPLE_COUNT")]
    pub target_sample_count: i64,
    /// Slots open unconditionally from the start of each week
    #[arg(long, env = "OPEN_SLOTS_AT_INTERVAL_START", default_value_t = 0)]
    pub open_slots_at_interval_start: i64,
    #[arg(long, env = "RESERVATION_RETENTION_DAYS", default_value_t = 7)]
    pub reservation_retention_days: i64,
}

impl SamplerArgs {
    pub fn policy(&self) -> Result<AdmissionPolicy> {
        if self.target_sample_count <= 0 {
            return Err(SamplerError::configuration(format!(
                "target sample count must be positive, got {}",
                self.target_sample_count
            )));
        }
        if self.target_sample_count > MAX_TARGET_SAMPLE_COUNT {
            return Err(SamplerError::configuration(format!(
                "target sample count {} exceeds the maximum of {MAX_TARGET_SAMPLE_COUNT}",
                self.target_sample_count
            )));
        }
        if self.open_slots_at_interval_start < 0 {
            return Err(SamplerError::configuration(format!(
                "open slots at interval start must not be negative, got {}",
                self.open_slots_at_interval_start
            )));
        }
        if self.reservation_retention_days <= 0 {
            return Err(SamplerError::configuration(
                "reservation retention must be at least one day",
            ));
        }

        Ok(AdmissionPolicy {
            plan: CurvePlan {
                target: self.target_sample_count,
                floor: self.open_slots_at_interval_start,
            },
            retention: chrono::Duration::days(self.reservation_retention_days),
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "LISTEN_PORT", default_value_t = 8080)]
    pub port: u16,
    #[arg(long, env = "ALLOW_ENTRY_CODE_UPLOAD", default_value_t = false)]
    pub allow_entry_code_upload: bool,
    #[arg(long, env = "WRONG_CODE_ATTEMPT_LIMIT", default_value_t = 10)]
    pub wrong_code_attempt_limit: u32,
    #[arg(long, env = "WRONG_CODE_WINDOW_SECS", default_value_t = 300)]
    pub wrong_code_window_secs: u64,
    #[arg(long, env = "FAILURE_DELAY_MAX_SECS", default_value_t = 10)]
    pub failure_delay_max_secs: u64,
    /// Run without Postgres; state is lost on exit
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler_args(target: i64, floor: i64) -> SamplerArgs {
        SamplerArgs {
            instance_id: "study-a".to_string(),
            sample_file_path: PathBuf::from("sample.csv"),
            target_sample_count: target,
            open_slots_at_interval_start: floor,
            reservation_retention_days: 7,
        }
    }

    #[test]
    fn policy_validates_counts() {
        let policy = sampler_args(120, 5).policy().unwrap();
        assert_eq!(policy.plan, CurvePlan { target: 120, floor: 5 });
        assert_eq!(policy.retention, chrono::Duration::days(7));

        assert!(matches!(
            sampler_args(0, 0).policy().unwrap_err(),
            SamplerError::Configuration(_)
        ));
        assert!(sampler_args(10, -1).policy().is_err());
    }

    #[test]
    fn oversized_target_is_a_configuration_error() {
        assert!(sampler_args(MAX_TARGET_SAMPLE_COUNT, 0).policy().is_ok());
        let err = sampler_args(MAX_TARGET_SAMPLE_COUNT + 1, 0).policy().unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
        assert!(sampler_args(i64::MAX, 0).policy().is_err());
    }

    #[test]
    fn timeout_never_zero() {
        let args = DatabaseArgs {
            database_url: None,
            db_timeout: 0,
            db_max_pool_size: 1,
            db_idle_conn_timeout: 1,
        };
        assert_eq!(args.timeout(), Duration::from_secs(1));
    }
}
