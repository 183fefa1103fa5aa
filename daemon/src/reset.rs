//! Factory reset.
//!
//! Seeds are validated and written before anything irreversible happens.
//! Once the TPM has been cleared there is no way back: the data partitions
//! are deleted and the machine reboots into a fresh first boot.

use serde::Deserialize;
use std::collections::BTreeMap;
use strata_core::seed::{self, SeedBundle};
use strata_core::{partition_path, ScheduledReboot, StrataConfig, StrataError};
use strata_platform::Sgdisk;

use crate::host::Host;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetRequest {
    /// Seed name to raw payload.
    pub seeds: BTreeMap<String, Vec<u8>>,
    pub wipe_existing_seeds: bool,
    pub allow_tpm_reset_failure: bool,
}

#[derive(Deserialize)]
struct ResetRequestBody {
    #[serde(default)]
    seeds: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    wipe_existing_seeds: bool,
    #[serde(default)]
    allow_tpm_reset_failure: bool,
}

impl ResetRequest {
    /// Decode a request body where each seed is an inline JSON document.
    pub fn from_json(body: &[u8]) -> Result<Self, StrataError> {
        let body: ResetRequestBody = serde_json::from_slice(body)?;

        let seeds = body
            .seeds
            .into_iter()
            .map(|(name, value)| Ok((name, serde_json::to_vec(&value)?)))
            .collect::<Result<BTreeMap<_, _>, StrataError>>()?;

        Ok(Self {
            seeds,
            wipe_existing_seeds: body.wipe_existing_seeds,
            allow_tpm_reset_failure: body.allow_tpm_reset_failure,
        })
    }
}

pub struct ResetOrchestrator {
    host: Host,
    config: StrataConfig,
}

impl ResetOrchestrator {
    pub fn new(host: Host, config: StrataConfig) -> Self {
        Self { host, config }
    }

    /// Reset the machine. On success the reboot is already armed.
    pub async fn run(&self, request: ResetRequest) -> Result<ScheduledReboot, StrataError> {
        for (name, payload) in &request.seeds {
            validate_seed_name(name)?;
            seed::validate_seed_payload(name, payload)?;
        }

        let device = self.host.system_disk(&self.config.paths)?;
        let seed_partition = partition_path(&device, self.config.layout.seed);

        let mut bundle = if request.wipe_existing_seeds {
            SeedBundle::new()
        } else {
            seed::read_existing(&seed_partition)?
        };
        for (name, payload) in request.seeds {
            bundle.insert(&name, payload);
        }
        seed::write_bundle(&seed_partition, &bundle)?;

        // Everything from here on leaves the system unbootable if it fails.
        log::info!("Clearing TPM state");
        if let Err(e) = self.host.runner.run_checked("tpm2_clear", &[]).await {
            if !request.allow_tpm_reset_failure {
                return Err(e.interrupted("Clearing the TPM"));
            }
            log::warn!("Ignoring TPM clear failure: {}", e);
        }

        let sgdisk = Sgdisk::new(self.host.runner.as_ref());
        for index in self.config.layout.reset_targets() {
            sgdisk
                .delete_partition(&device, index)
                .await
                .map_err(|e| e.interrupted("Deleting data partitions"))?;
        }

        self.host.power.sync_disks();
        Ok(self
            .host
            .reboot_scheduler()
            .schedule(self.config.reboot.reset_delay()))
    }
}

fn validate_seed_name(name: &str) -> Result<(), StrataError> {
    if name.is_empty() || name.contains(['/', '.']) {
        return Err(StrataError::InvalidSeedPayload {
            seed: name.to_string(),
            reason: "seed names must be non-empty and contain no '/' or '.'".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_json() {
        let body = br#"{
            "seeds": {"network": {"dns": {"hostname": "edge-1"}}, "incus": {"apply_defaults": true}},
            "allow_tpm_reset_failure": true
        }"#;

        let request = ResetRequest::from_json(body).unwrap();
        assert!(!request.wipe_existing_seeds);
        assert!(request.allow_tpm_reset_failure);
        assert_eq!(request.seeds.len(), 2);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&request.seeds["network"]).unwrap(),
            serde_json::json!({"dns": {"hostname": "edge-1"}})
        );
    }

    #[test]
    fn test_empty_body_is_an_empty_request() {
        assert_eq!(ResetRequest::from_json(b"{}").unwrap(), ResetRequest::default());
    }

    #[test]
    fn test_seed_names() {
        assert!(validate_seed_name("network").is_ok());
        assert!(validate_seed_name("").is_err());
        assert!(validate_seed_name("network.yaml").is_err());
        assert!(validate_seed_name("../etc").is_err());
    }
}
