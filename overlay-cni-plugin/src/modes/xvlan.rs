use ipnetwork::Ipv4Network;
use overlay_cni_agent::kubernetes::{self, KubeNodeResolver, NodeResolver};
use overlay_cni_ipam::KvStore;
use tracing::{debug, info};

use crate::config::Args;
use crate::context::PluginContext;
use crate::modes::veth::short_hash;
use crate::modes::{Mode, check_interface, success, verify_binding};
use crate::netlink::{Netlink, SubInterface, in_netns, open_netns};
use crate::response::Success;
use crate::types::NetConf;
use crate::{Error, Result};

/// Pods get an ipvlan (L2) or bridge mode macvlan child of the node's
/// primary interface, with addresses from a fixed range of the node block.
pub struct Xvlan {
    kind: SubInterface,
}

impl Xvlan {
    pub fn ipvlan() -> Self {
        Self {
            kind: SubInterface::Ipvlan,
        }
    }

    pub fn macvlan() -> Self {
        Self {
            kind: SubInterface::Macvlan,
        }
    }
}

#[tonic::async_trait]
impl<S: KvStore> Mode<S> for Xvlan {
    fn mode_name(&self) -> &'static str {
        match self.kind {
            SubInterface::Ipvlan => "ipvlan",
            SubInterface::Macvlan => "macvlan",
        }
    }

    async fn bootstrap(
        &self,
        ctx: &PluginContext<S>,
        args: &Args,
        conf: &NetConf,
    ) -> Result<Success> {
        let Some(range) = conf.range()? else {
            return Err(Error::InvalidNetworkConfig(format!(
                "{} mode needs ipam.rangeStart and ipam.rangeEnd",
                <Self as Mode<S>>::mode_name(self)
            )));
        };
        let id = args.container_id()?;
        let ifname = args.ifname()?.to_owned();
        let netns_path = args.net_ns()?.clone();

        let ipam = ctx.ipam();
        let block = ipam.bootstrap(Some(range)).await?;
        let ip = ipam.allocator().allocate(id).await?;

        let resolver = KubeNodeResolver::new(kubernetes::client().await?);
        let node_ip = resolver.internal_ip(ipam.node()).await?;
        let nl = Netlink::new()?;
        let master = nl
            .link_with_address(node_ip)
            .await?
            .ok_or_else(|| Error::Link(format!("no link holds the node address {node_ip}")))?;

        let temp_name = format!("xv_{}", short_hash(id));
        let link = nl.create_sub_interface(&temp_name, master, self.kind).await?;
        let netns = open_netns(&netns_path)?;
        nl.move_to(link.index, &netns).await?;
        debug!(master, device = %temp_name, "moved sub interface into the pod");

        let prefix = block.prefix();
        let name = ifname.clone();
        let pod = in_netns(netns_path.clone(), move |nl| async move {
            let link = nl.require_link(&temp_name).await?;
            nl.rename(link.index, &name).await?;
            nl.add_address(link.index, ip, prefix).await?;
            nl.set_up(link.index).await?;
            nl.require_link(&name).await
        })
        .await?;

        info!(%ip, master, "pod sub interface ready");
        let address = Ipv4Network::new(ip, prefix).map_err(|e| Error::Link(e.to_string()))?;
        Ok(success(conf, &ifname, &pod.mac, netns_path, address, None))
    }

    async fn unmount(&self, ctx: &PluginContext<S>, args: &Args, _conf: &NetConf) -> Result<()> {
        if let Some(ip) = ctx
            .ipam()
            .allocator()
            .release_container(args.container_id()?)
            .await?
        {
            debug!(%ip, "released pod address");
        }

        // the sub interface lives only in the pod namespace
        let Ok(netns_path) = args.net_ns() else {
            return Ok(());
        };
        if !netns_path.exists() {
            return Ok(());
        }
        let ifname = args.ifname()?.to_owned();
        in_netns(netns_path.clone(), move |nl| async move {
            nl.delete_link(&ifname).await?;
            Ok(())
        })
        .await
    }

    async fn check(&self, ctx: &PluginContext<S>, args: &Args, _conf: &NetConf) -> Result<()> {
        let ip = verify_binding(ctx, args).await?;
        check_interface(args.net_ns()?, args.ifname()?, ip).await
    }
}
