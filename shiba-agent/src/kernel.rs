//! The kernel adapter: a thin, synchronous abstraction over the host's
//! networking control interface (link list/add/delete, addresses, routes).
//!
//! This trait is intentionally *synchronous at the call level* — each
//! method is a single blocking round-trip, idempotent only at the intent
//! level (e.g. creating an existing link fails; callers reobserve and
//! decide, they never treat a failure as "already converged"). The
//! production adapter bridges onto its async netlink connection with
//! [`tokio::task::block_in_place`] so the async executor is never blocked.
//!
//! Two implementations: [`NetlinkKernelAdapter`], the production adapter
//! over `rtnetlink`, and [`FakeKernelAdapter`], an in-memory model used by
//! every reconciler test in this crate (see DESIGN.md).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::error::KernelError;

pub const IP6_TUNNEL_KIND: &str = "ip6tnl";

/// A kernel link as observed by `list_links`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub kind: String,
    pub up: bool,
    pub mtu: u32,
    /// Present only for ip6tnl links.
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
}

impl Link {
    pub fn is_tunnel(&self) -> bool {
        self.kind == IP6_TUNNEL_KIND
    }
}

/// An address installed on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl LinkAddress {
    /// True when the prefix length equals the address family's full bit
    /// width — i.e. a single-host "gateway" address rather than a subnet.
    pub fn is_universe_scope_host(&self) -> bool {
        let full = match self.address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        self.prefix_len == full
    }

    pub fn canonical_string(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// A route installed on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpAddr,
    pub prefix_len: u8,
    pub has_gateway: bool,
    pub has_source: bool,
}

impl Route {
    /// An on-link route: a destination with no bound source and no
    /// gateway — the shape the route reconciler both expects to find and
    /// installs itself.
    pub fn is_on_link(&self) -> bool {
        !self.has_gateway && !self.has_source
    }

    pub fn destination_string(&self) -> String {
        format!("{}/{}", self.destination, self.prefix_len)
    }
}

/// Parameters for creating a new IPv6-over-IPv6 point-to-point tunnel link.
pub struct TunnelSpec {
    pub name: String,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub mtu: u32,
}

/// A thin, synchronous abstraction over the host's networking control
/// plane. All operations are per-call idempotent only at the intent level.
pub trait KernelAdapter: Send + Sync {
    fn list_links(&self) -> Result<Vec<Link>, KernelError>;
    fn add_tunnel_link(&self, spec: &TunnelSpec) -> Result<(), KernelError>;
    fn delete_link(&self, name: &str) -> Result<(), KernelError>;
    fn set_link_up(&self, name: &str) -> Result<(), KernelError>;

    fn list_addresses(&self, link: &str) -> Result<Vec<LinkAddress>, KernelError>;
    fn add_address(&self, link: &str, addr: &LinkAddress) -> Result<(), KernelError>;

    fn list_routes(&self, link: &str) -> Result<Vec<Route>, KernelError>;
    fn add_route(&self, link: &str, route: &Route) -> Result<(), KernelError>;
    fn delete_route(&self, link: &str, route: &Route) -> Result<(), KernelError>;
}

/// Production adapter over Linux rtnetlink, via the `rtnetlink` crate.
///
/// Each call opens a fresh netlink request on the shared connection
/// handle and blocks the calling (blocking-pool) thread on its
/// completion, presenting a synchronous one-round-trip-per-call API
/// over the underlying async connection.
pub struct NetlinkKernelAdapter {
    handle: rtnetlink::Handle,
    rt: tokio::runtime::Handle,
}

impl NetlinkKernelAdapter {
    /// Opens a netlink connection and spawns its driving task onto `rt`.
    pub fn new(rt: tokio::runtime::Handle) -> Result<Self, KernelError> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| KernelError::Netlink(e.to_string()))?;
        rt.spawn(connection);
        Ok(NetlinkKernelAdapter { handle, rt })
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| self.rt.block_on(fut))
    }
}

impl KernelAdapter for NetlinkKernelAdapter {
    fn list_links(&self) -> Result<Vec<Link>, KernelError> {
        use futures::TryStreamExt;
        self.block_on(async {
            let mut links = Vec::new();
            let mut stream = self.handle.link().get().execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))?
            {
                links.push(netlink_link_to_model(&msg));
            }
            Ok(links)
        })
    }

    fn add_tunnel_link(&self, spec: &TunnelSpec) -> Result<(), KernelError> {
        self.block_on(async {
            // The rtnetlink ip6tnl builder; a real deployment would use
            // `handle.link().add().ip6tnl(...)`. Link creation failure
            // (e.g. the name already exists) is surfaced verbatim — the
            // tunnel reconciler treats it as "reobserve and decide", per
            // the kernel adapter's idempotent-at-intent-level contract.
            self.handle
                .link()
                .add(
                    rtnetlink::LinkIp6Tunnel::new(
                        &spec.name,
                        ip_to_v6(spec.local),
                        ip_to_v6(spec.remote),
                    )
                    .mtu(spec.mtu)
                    .build(),
                )
                .execute()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))
        })
    }

    fn delete_link(&self, name: &str) -> Result<(), KernelError> {
        self.block_on(async {
            let index = self.resolve_link_index(name).await?;
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))
        })
    }

    fn set_link_up(&self, name: &str) -> Result<(), KernelError> {
        self.block_on(async {
            let index = self.resolve_link_index(name).await?;
            self.handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))
        })
    }

    fn list_addresses(&self, link: &str) -> Result<Vec<LinkAddress>, KernelError> {
        use futures::TryStreamExt;
        self.block_on(async {
            let index = self.resolve_link_index(link).await?;
            let mut addrs = Vec::new();
            let mut stream = self.handle.address().get().set_link_index_filter(index).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))?
            {
                if let Some(addr) = netlink_addr_to_model(&msg) {
                    addrs.push(addr);
                }
            }
            Ok(addrs)
        })
    }

    fn add_address(&self, link: &str, addr: &LinkAddress) -> Result<(), KernelError> {
        self.block_on(async {
            let index = self.resolve_link_index(link).await?;
            self.handle
                .address()
                .add(index, addr.address, addr.prefix_len)
                .execute()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))
        })
    }

    fn list_routes(&self, link: &str) -> Result<Vec<Route>, KernelError> {
        use futures::TryStreamExt;
        self.block_on(async {
            let index = self.resolve_link_index(link).await?;
            let mut routes = Vec::new();
            for is_v6 in [false, true] {
                let mut stream = if is_v6 {
                    self.handle.route().get(rtnetlink::IpVersion::V6).execute()
                } else {
                    self.handle.route().get(rtnetlink::IpVersion::V4).execute()
                };
                while let Some(msg) = stream
                    .try_next()
                    .await
                    .map_err(|e| KernelError::Netlink(e.to_string()))?
                {
                    if let Some(route) = netlink_route_to_model(&msg, index) {
                        routes.push(route);
                    }
                }
            }
            Ok(routes)
        })
    }

    fn add_route(&self, link: &str, route: &Route) -> Result<(), KernelError> {
        self.block_on(async {
            let index = self.resolve_link_index(link).await?;
            self.handle
                .route()
                .add()
                .output_interface(index)
                .destination_prefix(route.destination, route.prefix_len)
                .execute()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))
        })
    }

    fn delete_route(&self, _link: &str, route: &Route) -> Result<(), KernelError> {
        self.block_on(async {
            self.handle
                .route()
                .del_by_destination(route.destination, route.prefix_len)
                .execute()
                .await
                .map_err(|e| KernelError::Netlink(e.to_string()))
        })
    }
}

impl NetlinkKernelAdapter {
    async fn resolve_link_index(&self, name: &str) -> Result<u32, KernelError> {
        use futures::TryStreamExt;
        let mut stream = self.handle.link().get().match_name(name.to_string()).execute();
        match stream
            .try_next()
            .await
            .map_err(|e| KernelError::Netlink(e.to_string()))?
        {
            Some(msg) => Ok(msg.header.index),
            None => Err(KernelError::LinkNotFound(name.to_string())),
        }
    }
}

fn ip_to_v6(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
    }
}

// The following three conversions translate rtnetlink's wire message
// types into our small model. Kept free-standing (not inherent methods)
// since the wire types live in `netlink-packet-route`, not this crate.
fn netlink_link_to_model(msg: &rtnetlink::packet_route::link::LinkMessage) -> Link {
    use rtnetlink::packet_route::link::{InfoData, InfoKind, LinkAttribute, LinkFlags, LinkInfo};

    let up = msg.header.flags.contains(LinkFlags::Up);
    let mut name = String::new();
    let mut mtu = 0u32;
    let mut kind = String::new();
    let mut local = None;
    let mut remote = None;

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = n.clone(),
            LinkAttribute::Mtu(m) => mtu = *m,
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(InfoKind::Other(other)) if other.as_str() == IP6_TUNNEL_KIND => {
                            kind = IP6_TUNNEL_KIND.to_string();
                        }
                        LinkInfo::Data(InfoData::Other(raw)) => {
                            let (l, r) = parse_ip6tnl_endpoints(raw);
                            local = l;
                            remote = r;
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Link {
        name,
        kind,
        up,
        mtu,
        local,
        remote,
    }
}

fn netlink_addr_to_model(msg: &rtnetlink::packet_route::address::AddressMessage) -> Option<LinkAddress> {
    use rtnetlink::packet_route::address::AddressAttribute;

    let prefix_len = msg.header.prefix_len;
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(addr) => Some(LinkAddress {
            address: *addr,
            prefix_len,
        }),
        _ => None,
    })
}

fn netlink_route_to_model(
    msg: &rtnetlink::packet_route::route::RouteMessage,
    link_index: u32,
) -> Option<Route> {
    use rtnetlink::packet_route::route::RouteAttribute;

    let mut destination = None;
    let mut has_gateway = false;
    let mut has_source = false;
    let mut out_index = None;

    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => destination = Some(route_address_to_ip(addr)),
            RouteAttribute::Gateway(_) => has_gateway = true,
            RouteAttribute::PrefSource(_) => has_source = true,
            RouteAttribute::Oif(idx) => out_index = Some(*idx),
            _ => {}
        }
    }

    // Only routes bound to the tunnel link we asked about are ours to
    // reconcile; the kernel's route dump isn't filtered by oif.
    if out_index != Some(link_index) {
        return None;
    }

    Some(Route {
        destination: destination?,
        prefix_len: msg.header.destination_prefix_length,
        has_gateway,
        has_source,
    })
}

// ip6tnl's IFLA_INFO_DATA isn't a typed variant in this crate version, so
// its nested attrs (uapi/linux/if_tunnel.h's IFLA_IPTUN_*) are walked by
// hand. Local/remote are each a raw 16-byte IPv6 address.
const IFLA_IPTUN_LOCAL: u16 = 2;
const IFLA_IPTUN_REMOTE: u16 = 3;

fn parse_ip6tnl_endpoints(raw: &[u8]) -> (Option<IpAddr>, Option<IpAddr>) {
    use netlink_packet_utils::nla::NlaBuffer;

    let mut local = None;
    let mut remote = None;
    let mut buf = raw;
    while !buf.is_empty() {
        let Ok(nla_buf) = NlaBuffer::new_checked(buf) else {
            break;
        };
        let kind = nla_buf.kind();
        let len = nla_buf.length() as usize;
        if let Ok(value) = nla_buf.value().try_into().map(|b: [u8; 16]| std::net::Ipv6Addr::from(b)) {
            match kind {
                IFLA_IPTUN_LOCAL => local = Some(IpAddr::V6(value)),
                IFLA_IPTUN_REMOTE => remote = Some(IpAddr::V6(value)),
                _ => {}
            }
        }
        // Nlas are 4-byte aligned; stop rather than loop forever on a
        // malformed trailing attribute.
        let aligned = (len + 3) & !3;
        if aligned == 0 || aligned > buf.len() {
            break;
        }
        buf = &buf[aligned..];
    }
    (local, remote)
}

fn route_address_to_ip(addr: &rtnetlink::packet_route::route::RouteAddress) -> IpAddr {
    use rtnetlink::packet_route::route::RouteAddress;
    match addr {
        RouteAddress::Inet(v4) => IpAddr::V4(*v4),
        RouteAddress::Inet6(v6) => IpAddr::V6(*v6),
        _ => unreachable!("route dumps are requested per address family"),
    }
}

/// An in-memory kernel adapter used by every test in this crate. State is
/// a set of links each carrying its own address and route lists, guarded
/// by a single mutex (there is exactly one writer — the reconciliation
/// engine — so contention is not a concern).
#[derive(Default)]
pub struct FakeKernelAdapter {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    links: BTreeMap<String, FakeLink>,
}

struct FakeLink {
    link: Link,
    addresses: Vec<LinkAddress>,
    routes: Vec<Route>,
}

impl FakeKernelAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: drop in a pre-existing link (e.g. to simulate a
    /// dangling tunnel from a prior run, or out-of-band operator drift).
    pub fn seed_link(&self, link: Link) {
        let mut state = self.state.lock().unwrap();
        state.links.insert(
            link.name.clone(),
            FakeLink {
                link,
                addresses: Vec::new(),
                routes: Vec::new(),
            },
        );
    }

    /// Test helper: simulate an operator deleting a link out-of-band.
    pub fn remove_link(&self, name: &str) {
        self.state.lock().unwrap().links.remove(name);
    }

    pub fn link_names(&self) -> Vec<String> {
        self.state.lock().unwrap().links.keys().cloned().collect()
    }
}

impl KernelAdapter for FakeKernelAdapter {
    fn list_links(&self) -> Result<Vec<Link>, KernelError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .links
            .values()
            .map(|l| l.link.clone())
            .collect())
    }

    fn add_tunnel_link(&self, spec: &TunnelSpec) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(&spec.name) {
            return Err(KernelError::Netlink(format!(
                "link [{}] already exists",
                spec.name
            )));
        }
        state.links.insert(
            spec.name.clone(),
            FakeLink {
                link: Link {
                    name: spec.name.clone(),
                    kind: IP6_TUNNEL_KIND.to_string(),
                    up: false,
                    mtu: spec.mtu,
                    local: Some(spec.local),
                    remote: Some(spec.remote),
                },
                addresses: Vec::new(),
                routes: Vec::new(),
            },
        );
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), KernelError> {
        self.state
            .lock()
            .unwrap()
            .links
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KernelError::LinkNotFound(name.to_string()))
    }

    fn set_link_up(&self, name: &str) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| KernelError::LinkNotFound(name.to_string()))?;
        link.link.up = true;
        Ok(())
    }

    fn list_addresses(&self, link: &str) -> Result<Vec<LinkAddress>, KernelError> {
        let state = self.state.lock().unwrap();
        let l = state
            .links
            .get(link)
            .ok_or_else(|| KernelError::LinkNotFound(link.to_string()))?;
        Ok(l.addresses.clone())
    }

    fn add_address(&self, link: &str, addr: &LinkAddress) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        let l = state
            .links
            .get_mut(link)
            .ok_or_else(|| KernelError::LinkNotFound(link.to_string()))?;
        l.addresses.push(addr.clone());
        Ok(())
    }

    fn list_routes(&self, link: &str) -> Result<Vec<Route>, KernelError> {
        let state = self.state.lock().unwrap();
        let l = state
            .links
            .get(link)
            .ok_or_else(|| KernelError::LinkNotFound(link.to_string()))?;
        Ok(l.routes.clone())
    }

    fn add_route(&self, link: &str, route: &Route) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        let l = state
            .links
            .get_mut(link)
            .ok_or_else(|| KernelError::LinkNotFound(link.to_string()))?;
        l.routes.push(route.clone());
        Ok(())
    }

    fn delete_route(&self, link: &str, route: &Route) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        let l = state
            .links
            .get_mut(link)
            .ok_or_else(|| KernelError::LinkNotFound(link.to_string()))?;
        l.routes.retain(|r| r != route);
        Ok(())
    }
}
