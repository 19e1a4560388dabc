//! The allocation/release orchestrator.
//!
//! Drives one CNI ADD or DEL through retrieve, select, filter, verify,
//! per-NIC allocation and endpoint recording, rolling back partial leases
//! when anything fails. Each request runs independently; all shared state
//! lives behind the Store's optimistic concurrency.

use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crds::{IPAllocationDetail, PodIPAllocation, SpiderEndpoint};
use store::{ignore_not_found, Store};

use crate::candidate::CandidateSelector;
use crate::config::IpamConfig;
use crate::endpoint::{
    retrieve_ip_allocation, EndpointManager, EndpointManagerConfig,
};
use crate::error::{aggregate, IpamError};
use crate::filter::{verify_pool_candidates, CandidateFilter};
use crate::ippool::IPPoolManager;
use crate::limiter::{Limiter, LimiterError};
use crate::metrics::IpamMetrics;
use crate::pod::{
    check_pod_allocatable, is_valid_statefulset_pod, owned_by_statefulset, owner_controller,
    top_controller,
};
use crate::routes::{
    convert_spec_routes, gen_ip_assignment_annotation, get_custom_routes,
    group_custom_routes_by_gw,
};
use crate::types::{
    convert_ip_details_to_configs_and_routes, convert_results_to_configs_and_routes,
    convert_results_to_details, group_ip_details, AddRequest, AddResponse, AllocationResult,
    DelRequest, PoolCandidate, ToBeAllocated,
};

/// The IPAM core. One instance serves all requests of the agent process.
pub struct Ipam {
    config: IpamConfig,
    store: Arc<dyn Store>,
    limiter: Limiter,
    ippool_manager: IPPoolManager,
    endpoint_manager: EndpointManager,
    candidate_selector: CandidateSelector,
    filter: CandidateFilter,
    metrics: IpamMetrics,
}

impl Ipam {
    pub fn new(config: IpamConfig, store: Arc<dyn Store>) -> Result<Self, IpamError> {
        config.validate()?;

        let ippool_manager = IPPoolManager::new(
            store.clone(),
            config.max_conflict_retries,
            config.conflict_retry_unit,
        );
        let endpoint_manager = EndpointManager::new(
            store.clone(),
            EndpointManagerConfig {
                max_conflict_retries: config.max_conflict_retries,
                conflict_retry_unit: config.conflict_retry_unit,
                max_history_records: config.max_history_records,
            },
        );
        let candidate_selector = CandidateSelector::new(store.clone(), config.clone());
        let filter = CandidateFilter::new(store.clone());
        let limiter = Limiter::new(config.limiter.clone());

        Ok(Self {
            config,
            store,
            limiter,
            ippool_manager,
            endpoint_manager,
            candidate_selector,
            filter,
            metrics: IpamMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &IpamMetrics {
        &self.metrics
    }

    /// Serves one CNI ADD.
    pub async fn allocate(
        &self,
        cancel: &CancellationToken,
        args: &AddRequest,
    ) -> Result<AddResponse, IpamError> {
        if cancel.is_cancelled() {
            return Err(IpamError::Canceled);
        }
        info!(
            "Start to allocate IP for Pod {}/{}",
            args.pod_namespace, args.pod_name
        );

        let pod = self
            .store
            .get_pod(&args.pod_namespace, &args.pod_name)
            .await?;
        let (phase, allocatable) = check_pod_allocatable(&pod);
        if !allocatable {
            return Err(IpamError::AbortUnallocatable(format!(
                "{} Pod {}/{} cannot allocate IP addresses",
                phase.to_lowercase(),
                args.pod_namespace,
                args.pod_name
            )));
        }

        let endpoint = ignore_not_found(
            self.store
                .get_endpoint(&args.pod_namespace, &args.pod_name)
                .await,
        )?;

        let (owner_kind, owner_name) = owner_controller(&pod);
        if self.config.enable_statefulset && owned_by_statefulset(&owner_kind) {
            let retrieved = self
                .retrieve_sts_ip_allocation(cancel, &args.container_id, &args.if_name, &pod, endpoint.clone())
                .await
                .map_err(|e| {
                    warn!(
                        "Failed to retrieve the IP allocation of StatefulSet {}/{}: {}",
                        args.pod_namespace, owner_name, e
                    );
                    e
                })?;
            if let Some(response) = retrieved {
                return Ok(response);
            }
        } else if let Some(response) =
            self.retrieve_multi_nic_ip_allocation(&args.container_id, &args.if_name, endpoint.as_ref())
        {
            return Ok(response);
        }

        self.allocate_in_standard_mode(cancel, args, &pod, endpoint)
            .await
    }

    /// A StatefulSet Pod recreated under the same name re-attaches to the
    /// addresses its Endpoint still records: the pool entries are rewritten
    /// to the new container and the identical IPs are returned.
    async fn retrieve_sts_ip_allocation(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        nic: &str,
        pod: &Pod,
        endpoint: Option<SpiderEndpoint>,
    ) -> Result<Option<AddResponse>, IpamError> {
        let Some(mut endpoint) = endpoint else {
            debug!("Endpoint not found, nothing to retrieve for StatefulSet, allocate in standard mode");
            return Ok(None);
        };

        // A StatefulSet Pod's Endpoint always carries a current allocation.
        let current = endpoint
            .status
            .as_ref()
            .and_then(|s| s.current.clone())
            .ok_or_else(|| {
                IpamError::InvariantViolation(format!(
                    "current IP allocation is lost, Endpoint {} data broken",
                    endpoint
                ))
            })?;

        info!("Retrieve the IP allocation of StatefulSet");
        let mut nic_matched = false;
        for detail in &current.ips {
            if detail.nic == nic {
                self.ippool_manager
                    .update_allocated_ips(cancel, container_id, pod, detail)
                    .await?;
                nic_matched = true;
            }
        }
        if !nic_matched {
            return Err(IpamError::WrongInput(format!(
                "nic {} does not match the current IP allocation of StatefulSet",
                nic
            )));
        }

        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        self.endpoint_manager
            .reallocate_current_ip_allocation(container_id, &node, &mut endpoint)
            .await?;

        let (ips, routes) = convert_ip_details_to_configs_and_routes(&current.ips);
        let response = AddResponse { ips, routes };
        info!("Succeed to retrieve the IP allocation of StatefulSet");
        Ok(Some(response))
    }

    /// In multi-NIC mode a later ADD for an interface this container
    /// already holds returns the recorded allocation instead of leasing
    /// again.
    fn retrieve_multi_nic_ip_allocation(
        &self,
        container_id: &str,
        nic: &str,
        endpoint: Option<&SpiderEndpoint>,
    ) -> Option<AddResponse> {
        debug!("Try to retrieve the existing IP allocation in multi-NIC mode");
        let (allocation, _) = retrieve_ip_allocation(container_id, nic, endpoint)?;
        let (ips, routes) = convert_ip_details_to_configs_and_routes(&allocation.ips);
        info!("Succeed to retrieve the IP allocation in multi-NIC mode");
        Some(AddResponse { ips, routes })
    }

    async fn allocate_in_standard_mode(
        &self,
        cancel: &CancellationToken,
        args: &AddRequest,
        pod: &Pod,
        endpoint: Option<SpiderEndpoint>,
    ) -> Result<AddResponse, IpamError> {
        info!("Allocate IP addresses in standard mode");

        let to_be_allocated = self
            .gen_to_be_allocated_set(
                cancel,
                &args.if_name,
                &args.default_ipv4_pools,
                &args.default_ipv6_pools,
                args.clean_gateway,
                pod,
            )
            .await?;

        // The container ID is written to the Endpoint before any IP so an
        // interrupted request always leaves a record the GC can resolve.
        let mut endpoint = match endpoint {
            Some(mut existing) => {
                self.endpoint_manager
                    .re_mark_ip_allocation(&args.container_id, pod, &mut existing)
                    .await?;
                existing
            }
            None => {
                let controller = top_controller(&self.store, pod).await?;
                self.endpoint_manager
                    .mark_ip_allocation(&args.container_id, pod, &controller)
                    .await?
            }
        };

        let (results, err) = self
            .allocate_for_all_nics(cancel, &to_be_allocated, &args.container_id, &mut endpoint, pod)
            .await;

        if let Some(err) = err {
            if !results.is_empty() {
                let details = convert_results_to_details(&results);
                if let Err(rollback_err) = self
                    .release_details(cancel, &args.container_id, &details)
                    .await
                {
                    self.metrics.inc_allocation_rollback_failures();
                    warn!("Failed to roll back the allocated IPs: {}", rollback_err);
                    return Err(err);
                }
            }
            if let Err(clear_err) = self
                .endpoint_manager
                .clear_current_ip_allocation(&args.container_id, Some(&endpoint))
                .await
            {
                warn!("Failed to clear the current IP allocation: {}", clear_err);
            }
            return Err(err);
        }

        let (ips, routes) = convert_results_to_configs_and_routes(&results);

        // The IPs are already durably leased; a failed annotation write is
        // surfaced but must not undo them.
        let annotations = gen_ip_assignment_annotation(&ips)?;
        self.store
            .merge_pod_annotations(&args.pod_namespace, &args.pod_name, annotations)
            .await?;

        let response = AddResponse { ips, routes };
        info!("Succeed to allocate: {} IP(s)", response.ips.len());
        Ok(response)
    }

    async fn gen_to_be_allocated_set(
        &self,
        cancel: &CancellationToken,
        nic: &str,
        default_v4_pools: &[String],
        default_v6_pools: &[String],
        clean_gateway: bool,
        pod: &Pod,
    ) -> Result<Vec<ToBeAllocated>, IpamError> {
        let mut preliminary = self
            .candidate_selector
            .get_pool_candidates(cancel, nic, default_v4_pools, default_v6_pools, clean_gateway, pod)
            .await?;
        debug!("Preliminary IPPool candidates: {:?}", preliminary);

        self.candidate_selector
            .check_ip_version_enable(&mut preliminary)?;
        self.filter
            .filter_pool_candidates(&mut preliminary, pod)
            .await?;
        debug!("Filtered IPPool candidates: {:?}", preliminary);

        verify_pool_candidates(&self.ippool_manager, &preliminary).await?;
        info!("All IPPool candidates valid");

        Ok(preliminary)
    }

    /// Sequentially allocates every `(nic, family)` of the plan, patching
    /// the Endpoint after each grant so partial progress is always durable.
    /// Returns whatever was granted together with the first error, which
    /// the caller rolls back.
    async fn allocate_for_all_nics(
        &self,
        cancel: &CancellationToken,
        to_be_allocated: &[ToBeAllocated],
        container_id: &str,
        endpoint: &mut SpiderEndpoint,
        pod: &Pod,
    ) -> (Vec<AllocationResult>, Option<IpamError>) {
        let mut custom_routes = match get_custom_routes(pod) {
            Ok(routes) => routes,
            Err(e) => return (Vec::new(), Some(e)),
        };

        let mut all_results: Vec<AllocationResult> = Vec::new();
        for t in to_be_allocated {
            for candidate in &t.pool_candidates {
                let mut result = match self
                    .allocate_ip_from_pool_candidates(
                        cancel,
                        candidate,
                        &t.nic,
                        container_id,
                        t.clean_gateway,
                        pod,
                    )
                    .await
                {
                    Ok(result) => result,
                    Err(e) => return (all_results, Some(e)),
                };

                match group_custom_routes_by_gw(&mut custom_routes, &result.ip) {
                    Ok(routes) => result.routes.extend(routes),
                    Err(e) => {
                        all_results.push(result);
                        return (all_results, Some(e));
                    }
                }
                all_results.push(result);

                let allocation = PodIPAllocation {
                    container_id: container_id.to_string(),
                    node: None,
                    ips: convert_results_to_details(&all_results),
                    creation_time: None,
                };
                if let Err(e) = self
                    .endpoint_manager
                    .patch_ip_allocation(&allocation, endpoint)
                    .await
                {
                    return (all_results, Some(e));
                }
            }
        }

        if !custom_routes.is_empty() {
            warn!("Invalid custom routes: {:?}", custom_routes);
        }

        (all_results, None)
    }

    /// Tries the candidate's pools in order under the Limiter; the first
    /// pool that grants an address wins and contributes its routes.
    async fn allocate_ip_from_pool_candidates(
        &self,
        cancel: &CancellationToken,
        candidate: &PoolCandidate,
        nic: &str,
        container_id: &str,
        clean_gateway: bool,
        pod: &Pod,
    ) -> Result<AllocationResult, IpamError> {
        // Queueing bounds the conflict storm on one pool; on failure the
        // allocation still proceeds and optimistic concurrency decides.
        let _ticket = match self.limiter.acquire(cancel, &candidate.pools).await {
            Ok(ticket) => Some(ticket),
            Err(LimiterError::Canceled) => return Err(IpamError::Canceled),
            Err(e) => {
                error!("Failed to queue correctly: {}", e);
                None
            }
        };

        let mut errs = Vec::new();
        for pool in &candidate.pools {
            match self
                .ippool_manager
                .allocate_ip(cancel, pool, container_id, nic, pod)
                .await
            {
                Ok((ip, pool_snapshot)) => {
                    info!(
                        "Allocate IPv{} IP {} to {} from IPPool {}",
                        candidate.ip_version, ip.address, nic, pool
                    );
                    return Ok(AllocationResult {
                        routes: convert_spec_routes(nic, &pool_snapshot.spec.routes),
                        ip,
                        clean_gateway,
                    });
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to allocate IPv{} IP to {} from IPPool {}: {}",
                        candidate.ip_version, nic, pool, e
                    );
                    errs.push(e);
                }
            }
        }

        Err(IpamError::NoAvailablePool(format!(
            "failed to allocate any IPv{} IP address to {} from IPPools {:?}: {}",
            candidate.ip_version,
            nic,
            candidate.pools,
            aggregate(&errs)
        )))
    }

    /// Serves one CNI DEL. Releasing an already-released container is a
    /// no-op.
    pub async fn release(
        &self,
        cancel: &CancellationToken,
        args: &DelRequest,
    ) -> Result<(), IpamError> {
        if cancel.is_cancelled() {
            return Err(IpamError::Canceled);
        }
        info!(
            "Start to release IP of Pod {}/{}",
            args.pod_namespace, args.pod_name
        );

        let pod = self
            .store
            .get_pod(&args.pod_namespace, &args.pod_name)
            .await?;

        let (owner_kind, _) = owner_controller(&pod);
        if self.config.enable_statefulset && owned_by_statefulset(&owner_kind) {
            let in_scale =
                is_valid_statefulset_pod(&self.store, &args.pod_namespace, &args.pod_name).await?;
            if in_scale {
                info!("No need to release the IP allocation of a StatefulSet whose scale is not reduced");
                return Ok(());
            }
        }

        let endpoint = ignore_not_found(
            self.store
                .get_endpoint(&args.pod_namespace, &args.pod_name)
                .await,
        )?;
        let Some((allocation, currently)) =
            retrieve_ip_allocation(&args.container_id, &args.if_name, endpoint.as_ref())
        else {
            info!("Nothing retrieved for releasing");
            return Ok(());
        };
        if !currently {
            warn!("Request to release a non-current IP allocation, concurrency may exist between the same Pod");
        }

        self.release_details(cancel, &allocation.container_id, &allocation.ips)
            .await?;
        self.endpoint_manager
            .clear_current_ip_allocation(&args.container_id, endpoint.as_ref())
            .await?;
        info!("Succeed to release: {} detail(s)", allocation.ips.len());

        Ok(())
    }

    /// Releases the recorded details pool by pool, in parallel with a
    /// barrier, aggregating per-pool failures.
    async fn release_details(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        details: &[IPAllocationDetail],
    ) -> Result<(), IpamError> {
        if details.is_empty() {
            return Ok(());
        }

        let grouped = group_ip_details(container_id, details);
        let tasks = grouped.into_iter().map(|(pool, entries)| async move {
            let _ticket = match self
                .limiter
                .acquire(cancel, std::slice::from_ref(&pool))
                .await
            {
                Ok(ticket) => Some(ticket),
                Err(LimiterError::Canceled) => return Err(IpamError::Canceled),
                Err(e) => {
                    error!("Failed to queue correctly: {}", e);
                    None
                }
            };

            self.ippool_manager
                .release_ips(cancel, &pool, &entries)
                .await?;
            info!(
                "Succeed to release IP addresses {:?} from IPPool {}",
                entries, pool
            );
            Ok(())
        });

        let errs: Vec<IpamError> = join_all(tasks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if !errs.is_empty() {
            return Err(IpamError::ReleaseFailed(aggregate(&errs)));
        }
        Ok(())
    }
}
