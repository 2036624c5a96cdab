pub mod tests {
    use crate::{
        Environment,
        EnvironmentBuilder,
        EnvironmentStatus,
        Job,
        JobBuilder,
        ProvisioningMode,
        RequestedResources,
        Run,
        Tenant,
    };

    pub const TEST_TENANT: &str = "tenant-test";
    pub const TEST_REGION: &str = "us-east-1";

    /// The tenant every mock environment belongs to.
    pub fn mock_tenant() -> Tenant {
        Tenant {
            id: TEST_TENANT.to_string(),
            name: "test tenant".to_string(),
            created_at: 1,
            updated_at: 1,
        }
    }

    pub fn mock_environment(status: EnvironmentStatus) -> Environment {
        mock_environment_with_capacity(status, 10, 256)
    }

    pub fn mock_environment_with_capacity(
        status: EnvironmentStatus,
        max_concurrent_runs: u32,
        max_vcpu: u32,
    ) -> Environment {
        EnvironmentBuilder::default()
            .tenant_id(TEST_TENANT.to_string())
            .region(TEST_REGION.to_string())
            .provisioning_mode(ProvisioningMode::Full)
            .max_concurrent_runs(max_concurrent_runs)
            .max_vcpu(max_vcpu)
            .status(status)
            .build()
            .unwrap()
    }

    pub fn mock_job(environment: &Environment) -> Job {
        JobBuilder::default()
            .environment_id(environment.id.clone())
            .name("nightly-aggregation".to_string())
            .artifact_uri("s3://artifacts/jobs/aggregate.py".to_string())
            .artifact_digest("sha256:0f1e2d".to_string())
            .entrypoint("aggregate.py".to_string())
            .args(vec!["--date".to_string(), "2024-01-01".to_string()])
            .build()
            .unwrap()
    }

    pub fn mock_run(job: &Job, environment: &Environment) -> Run {
        Run::new(
            job,
            environment,
            RequestedResources::default(),
            None,
            None,
            1,
        )
        .unwrap()
    }
}
