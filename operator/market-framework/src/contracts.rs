//! Bindings for the marketplace contracts.
//!
//! `JobManager` lives on the payment chain and owns job escrow.
//! `NodeReputation` lives on the reputation chain and owns provider
//! registration, heartbeats and job counts.

use alloy::sol;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract JobManager {
        struct Job {
            bytes32 jobId;
            address renter;
            address provider;
            uint256 payment;
            uint8 status;
            uint256 createdAt;
            uint256 confirmedAt;
        }

        /// Carries the container image and input CID so a job can be
        /// dispatched without a second lookup. Contracts emitting the bare
        /// `JobCreated(bytes32,address,address,uint256)` have a different
        /// topic0 and must be upgraded to this signature before the
        /// dispatcher sees their jobs.
        event JobCreated(
            bytes32 indexed jobId,
            address indexed renter,
            address indexed provider,
            uint256 payment,
            string dockerImage,
            string inputFileCID
        );
        event JobConfirmed(bytes32 indexed jobId, uint256 confirmedAt);

        function getJobInfo(bytes32 jobId) external view returns (Job memory);
    }
}

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract NodeReputation {
        struct Provider {
            string gpuModel;
            uint256 vram;
            uint256 lastSeen;
            bool isRegistered;
        }

        event NodeRegistered(address indexed provider, string gpuModel, uint256 vram);
        event NodeHeartbeat(address indexed provider, uint256 timestamp);
        event JobCountIncremented(address indexed provider, uint256 newCount);

        function incrementJobs(address provider) external;
        function getProviderInfo(address provider) external view returns (Provider memory, uint256 jobCount);
    }
}

#[cfg(test)]
mod tests {
    use alloy::hex::ToHexExt;
    use alloy::primitives::{Address, B256, Log as PrimitiveLog, U256, address};
    use alloy::sol_types::SolEvent;

    use super::*;

    #[test]
    fn test_job_created_round_trips_through_a_log() {
        let provider = address!("0x00000000000000000000000000000000000000aa");
        let event = JobManager::JobCreated {
            jobId: B256::repeat_byte(0xab),
            renter: Address::repeat_byte(0x11),
            provider,
            payment: U256::from(10u64).pow(U256::from(18u64)),
            dockerImage: "ghcr.io/acme/train:1".into(),
            inputFileCID: "QmInput".into(),
        };

        let log = PrimitiveLog {
            address: Address::ZERO,
            data: event.encode_log_data(),
        };
        let decoded = JobManager::JobCreated::decode_log(&log).unwrap().data;

        assert_eq!(decoded.provider, provider);
        assert_eq!(decoded.dockerImage, "ghcr.io/acme/train:1");
        assert_eq!(decoded.payment.to_string(), "1000000000000000000");
        assert_eq!(
            decoded.jobId.encode_hex_with_prefix(),
            format!("0x{}", "ab".repeat(32))
        );
    }
}
