//! The EC2 seam
//!
//! Everything above the AWS SDK works through [`Ec2Ops`] only, so the
//! launcher, reconciler, and manager can be exercised against stubs. The
//! [`AwsEc2`] implementation translates SDK failures into the oxbow error
//! taxonomy at this boundary.

use crate::catalog::InstanceConfig;
use async_trait::async_trait;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, IamInstanceProfileSpecification,
    InstanceStateName, InstanceType, RequestSpotLaunchSpecification, ResourceType, Tag,
    TagSpecification, VolumeType,
};
use chrono::{DateTime, Utc};
use oxbow_core::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Provider-visible VM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

/// A VM as reported by the provider. Identity is the provider-assigned id.
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    pub id: String,
    pub instance_type: String,
    pub state: VmState,
    pub private_dns: Option<String>,
    pub public_dns: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub launched_at: DateTime<Utc>,
}

impl PartialEq for ManagedInstance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl ManagedInstance {
    /// Whether the agent can be reached on this instance yet.
    pub fn running_with_dns(&self) -> bool {
        self.state == VmState::Running
            && self.public_dns.as_deref().is_some_and(|d| !d.is_empty())
    }
}

/// The EBS layout attached to each worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EbsLayout {
    pub volume_type: String,
    pub size_gib: u64,
    /// Number of volumes; more than one is assembled into RAID0 by the
    /// worker's userdata.
    pub slices: u64,
}

/// Everything needed to submit one VM launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub config: InstanceConfig,
    pub ami: String,
    pub spot: bool,
    /// Bid cap for spot launches, in USD per hour.
    pub spot_price: Option<f64>,
    pub subnet_id: Option<String>,
    pub security_group: String,
    pub instance_profile: Option<String>,
    pub key_name: Option<String>,
    /// Base64-encoded cloud-config userdata.
    pub user_data: String,
    pub ebs: EbsLayout,
    pub tags: BTreeMap<String, String>,
}

/// Status of a spot instance request.
#[derive(Debug, Clone)]
pub struct SpotRequestStatus {
    pub state: String,
    pub status_code: String,
    pub instance_id: Option<String>,
}

impl SpotRequestStatus {
    /// Status codes that mean the request will never be fulfilled for
    /// capacity or price reasons.
    pub fn unavailable(&self) -> bool {
        matches!(
            self.status_code.as_str(),
            "capacity-not-available"
                | "capacity-oversubscribed"
                | "price-too-low"
                | "not-scheduled-yet"
                | "launch-group-constraint"
                | "az-group-constraint"
                | "placement-group-constraint"
                | "constraint-not-fulfillable"
        ) || self.state == "failed"
    }
}

/// The narrow surface of EC2 the cluster uses.
#[async_trait]
pub trait Ec2Ops: Send + Sync {
    /// Launch one on-demand instance, returning its id.
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<String>;

    /// Submit one spot request, returning the request id.
    async fn request_spot_instance(&self, spec: &LaunchSpec) -> Result<String>;

    /// Describe spot requests by id.
    async fn describe_spot_requests(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, SpotRequestStatus>>;

    /// Cancel spot requests.
    async fn cancel_spot_requests(&self, ids: Vec<String>) -> Result<()>;

    /// Describe instances by id.
    async fn describe_instances(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, ManagedInstance>>;

    /// One page of the tag-filtered instance listing.
    async fn list_instances_page(
        &self,
        tags: &BTreeMap<String, String>,
        next_token: Option<String>,
    ) -> Result<(Vec<ManagedInstance>, Option<String>)>;

    async fn terminate_instance(&self, id: &str) -> Result<()>;

    async fn create_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// (zone id, zone name) pairs for the region.
    async fn availability_zones(&self) -> Result<Vec<(String, String)>>;

    /// (subnet id, zone name) pairs for the given subnets.
    async fn subnet_zones(&self, subnet_ids: &[String]) -> Result<Vec<(String, String)>>;

    /// Whether at least `depth` spot VMs of the type could currently be
    /// launched.
    async fn spot_capacity(&self, spec: &LaunchSpec, depth: usize) -> Result<bool>;
}

/// Classify an EC2 service error code into the taxonomy.
pub fn classify_ec2_code(code: &str, message: &str) -> Error {
    let kind = match code {
        "InsufficientInstanceCapacity" | "SpotMaxPriceTooLow" | "InstanceLimitExceeded"
        | "MaxSpotInstanceCountExceeded" => ErrorKind::Unavailable,
        "RequestLimitExceeded" | "Unavailable" | "InternalError" | "ServiceUnavailable" => {
            ErrorKind::Temporary
        }
        "InvalidAMIID.NotFound" | "InvalidAMIID.Malformed" | "UnauthorizedOperation"
        | "InvalidParameterValue" | "InvalidSubnetID.NotFound" | "InvalidGroup.NotFound" => {
            ErrorKind::Fatal
        }
        _ => ErrorKind::Other,
    };
    Error::new(kind, format!("{code}: {message}"))
}

fn sdk_error<E: ProvideErrorMetadata>(context: &str, err: E) -> Error {
    let code = err.code().unwrap_or("");
    let message = err.message().unwrap_or("unknown sdk error");
    Error::wrap(ErrorKind::Other, context.to_string(), classify_ec2_code(code, message))
}

/// `Ec2Ops` over the real AWS SDK client.
pub struct AwsEc2 {
    client: aws_sdk_ec2::Client,
}

impl AwsEc2 {
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }

    /// Build a client for `region` from the ambient AWS environment.
    pub async fn from_env(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_types::region::Region::new(region.to_string()))
            .load()
            .await;
        Self::new(aws_sdk_ec2::Client::new(&config))
    }

    fn block_devices(ebs: &EbsLayout) -> Vec<BlockDeviceMapping> {
        // Device names past /dev/xvda are the data slices assembled into
        // RAID0 by the worker.
        let mut mappings = vec![root_device()];
        let per_slice = (ebs.size_gib / ebs.slices.max(1)).max(1) as i32;
        for i in 0..ebs.slices.max(1) {
            let device = format!("/dev/xvd{}", (b'b' + i as u8) as char);
            mappings.push(
                BlockDeviceMapping::builder()
                    .device_name(device)
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(per_slice)
                            .volume_type(VolumeType::from(ebs.volume_type.as_str()))
                            .delete_on_termination(true)
                            .build(),
                    )
                    .build(),
            );
        }
        mappings
    }
}

fn root_device() -> BlockDeviceMapping {
    BlockDeviceMapping::builder()
        .device_name("/dev/xvda")
        .ebs(
            EbsBlockDevice::builder()
                .volume_size(16)
                .volume_type(VolumeType::Gp3)
                .delete_on_termination(true)
                .build(),
        )
        .build()
}

fn parse_instance(inst: &aws_sdk_ec2::types::Instance) -> Option<ManagedInstance> {
    let id = inst.instance_id()?.to_string();
    let state = inst
        .state()
        .and_then(|s| s.name())
        .map(|n| match n {
            InstanceStateName::Pending => VmState::Pending,
            InstanceStateName::Running => VmState::Running,
            InstanceStateName::ShuttingDown => VmState::ShuttingDown,
            InstanceStateName::Stopping => VmState::Stopping,
            InstanceStateName::Stopped => VmState::Stopped,
            InstanceStateName::Terminated => VmState::Terminated,
            _ => VmState::Unknown,
        })
        .unwrap_or(VmState::Unknown);
    let mut tags = BTreeMap::new();
    for tag in inst.tags() {
        if let (Some(k), Some(v)) = (tag.key(), tag.value()) {
            tags.insert(k.to_string(), v.to_string());
        }
    }
    let launched_at = inst
        .launch_time()
        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now);
    Some(ManagedInstance {
        id,
        instance_type: inst
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        state,
        private_dns: inst.private_dns_name().map(str::to_string).filter(|s| !s.is_empty()),
        public_dns: inst.public_dns_name().map(str::to_string).filter(|s| !s.is_empty()),
        tags,
        launched_at,
    })
}

#[async_trait]
impl Ec2Ops for AwsEc2 {
    async fn run_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .set_tags(Some(
                spec.tags
                    .iter()
                    .map(|(k, v)| Tag::builder().key(k).value(v).build())
                    .collect(),
            ))
            .build();
        let mut req = self
            .client
            .run_instances()
            .image_id(&spec.ami)
            .instance_type(InstanceType::from(spec.config.instance_type.as_str()))
            .security_group_ids(&spec.security_group)
            .set_subnet_id(spec.subnet_id.clone())
            .set_key_name(spec.key_name.clone())
            .user_data(&spec.user_data)
            .ebs_optimized(spec.config.ebs_optimized)
            .set_block_device_mappings(Some(Self::block_devices(&spec.ebs)))
            .tag_specifications(tag_spec)
            .min_count(1)
            .max_count(1);
        if let Some(profile) = &spec.instance_profile {
            req = req.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        let resp = req.send().await.map_err(|e| sdk_error("run instances", e.into_service_error()))?;
        resp.instances()
            .first()
            .and_then(|i| i.instance_id().map(str::to_string))
            .ok_or_else(|| Error::other("run instances returned no instance"))
    }

    async fn request_spot_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let mut launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.ami)
            .instance_type(InstanceType::from(spec.config.instance_type.as_str()))
            .security_group_ids(&spec.security_group)
            .set_subnet_id(spec.subnet_id.clone())
            .set_key_name(spec.key_name.clone())
            .user_data(&spec.user_data)
            .ebs_optimized(spec.config.ebs_optimized)
            .set_block_device_mappings(Some(Self::block_devices(&spec.ebs)));
        if let Some(profile) = &spec.instance_profile {
            launch = launch.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        let mut req = self
            .client
            .request_spot_instances()
            .instance_count(1)
            .launch_specification(launch.build());
        if let Some(price) = spec.spot_price {
            req = req.spot_price(format!("{price:.4}"));
        }
        let resp =
            req.send().await.map_err(|e| sdk_error("request spot", e.into_service_error()))?;
        resp.spot_instance_requests()
            .first()
            .and_then(|r| r.spot_instance_request_id().map(str::to_string))
            .ok_or_else(|| Error::other("spot request returned no request id"))
    }

    async fn describe_spot_requests(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, SpotRequestStatus>> {
        let resp = self
            .client
            .describe_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids))
            .send()
            .await
            .map_err(|e| sdk_error("describe spot requests", e.into_service_error()))?;
        let mut out = HashMap::new();
        for req in resp.spot_instance_requests() {
            let Some(id) = req.spot_instance_request_id() else { continue };
            out.insert(
                id.to_string(),
                SpotRequestStatus {
                    state: req.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
                    status_code: req
                        .status()
                        .and_then(|s| s.code())
                        .unwrap_or_default()
                        .to_string(),
                    instance_id: req.instance_id().map(str::to_string),
                },
            );
        }
        Ok(out)
    }

    async fn cancel_spot_requests(&self, ids: Vec<String>) -> Result<()> {
        self.client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids))
            .send()
            .await
            .map_err(|e| sdk_error("cancel spot requests", e.into_service_error()))?;
        Ok(())
    }

    async fn describe_instances(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, ManagedInstance>> {
        let resp = self
            .client
            .describe_instances()
            .set_instance_ids(Some(ids))
            .send()
            .await
            .map_err(|e| sdk_error("describe instances", e.into_service_error()))?;
        let mut out = HashMap::new();
        for resv in resp.reservations() {
            for inst in resv.instances() {
                if let Some(mi) = parse_instance(inst) {
                    out.insert(mi.id.clone(), mi);
                }
            }
        }
        Ok(out)
    }

    async fn list_instances_page(
        &self,
        tags: &BTreeMap<String, String>,
        next_token: Option<String>,
    ) -> Result<(Vec<ManagedInstance>, Option<String>)> {
        let mut req = self.client.describe_instances().max_results(1000);
        for (k, v) in tags {
            req = req.filters(Filter::builder().name(format!("tag:{k}")).values(v).build());
        }
        let resp = req
            .set_next_token(next_token)
            .send()
            .await
            .map_err(|e| sdk_error("list instances", e.into_service_error()))?;
        let mut out = Vec::new();
        for resv in resp.reservations() {
            for inst in resv.instances() {
                if let Some(mi) = parse_instance(inst) {
                    out.push(mi);
                }
            }
        }
        Ok((out, resp.next_token().map(str::to_string)))
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        debug!(instance_id = %id, "terminating instance");
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| sdk_error("terminate instance", e.into_service_error()))?;
        Ok(())
    }

    async fn create_tags(&self, id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut req = self.client.create_tags().resources(id);
        for (k, v) in tags {
            req = req.tags(Tag::builder().key(k).value(v).build());
        }
        req.send().await.map_err(|e| sdk_error("create tags", e.into_service_error()))?;
        Ok(())
    }

    async fn availability_zones(&self) -> Result<Vec<(String, String)>> {
        let resp = self
            .client
            .describe_availability_zones()
            .send()
            .await
            .map_err(|e| sdk_error("describe availability zones", e.into_service_error()))?;
        Ok(resp
            .availability_zones()
            .iter()
            .filter_map(|az| {
                Some((az.zone_id()?.to_string(), az.zone_name()?.to_string()))
            })
            .collect())
    }

    async fn subnet_zones(&self, subnet_ids: &[String]) -> Result<Vec<(String, String)>> {
        let resp = self
            .client
            .describe_subnets()
            .set_subnet_ids(Some(subnet_ids.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_error("describe subnets", e.into_service_error()))?;
        Ok(resp
            .subnets()
            .iter()
            .filter_map(|sn| {
                Some((sn.subnet_id()?.to_string(), sn.availability_zone()?.to_string()))
            })
            .collect())
    }

    async fn spot_capacity(&self, spec: &LaunchSpec, depth: usize) -> Result<bool> {
        // Submit a short-lived spot request at the probe depth, then cancel
        // it and inspect the status codes; a capacity-class code means the
        // type cannot currently be had.
        let launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.ami)
            .instance_type(InstanceType::from(spec.config.instance_type.as_str()))
            .security_group_ids(&spec.security_group)
            .set_subnet_id(spec.subnet_id.clone())
            .build();
        let resp = self
            .client
            .request_spot_instances()
            .instance_count(depth.max(1) as i32)
            .r#type(aws_sdk_ec2::types::SpotInstanceType::OneTime)
            .launch_specification(launch)
            .send()
            .await
            .map_err(|e| sdk_error("spot capacity probe", e.into_service_error()))?;
        let ids: Vec<String> = resp
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect();
        if ids.is_empty() {
            return Ok(false);
        }
        // Give the requests a moment to be evaluated before sampling.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let statuses = self.describe_spot_requests(ids.clone()).await?;
        self.cancel_spot_requests(ids.clone()).await?;
        let mut instances = Vec::new();
        for status in statuses.values() {
            if let Some(id) = &status.instance_id {
                instances.push(id.clone());
            }
            if status.unavailable() {
                // Clean up anything that was fulfilled before reporting.
                for id in &instances {
                    let _ = self.terminate_instance(id).await;
                }
                return Ok(false);
            }
        }
        for id in &instances {
            let _ = self.terminate_instance(id).await;
        }
        Ok(true)
    }
}
