//! Launch-argument derivation, kept free of I/O.

use std::collections::BTreeMap;

use api_types::ServerArgs;

use crate::launcher::role::RoleKind;
use crate::rendezvous::bootstrap_port;
use crate::rendezvous::dist_init_addr;
use crate::rendezvous::is_multi_node;
use crate::rendezvous::transfer_store_url;
use crate::rendezvous::Peer;

pub const SERVER_PORT: u16 = 8000;
pub const ROUTER_PORT: u16 = 6688;
pub const TRANSFER_BACKEND: &str = "ascend";
pub const STORE_URL_ENV: &str = "ASCEND_MF_STORE_URL";

/// Everything a pod needs to know to start its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub model_path: String,
    pub npus: u32,
    pub replicas: u32,
    pub npus_per_pod: u32,
    pub args: ServerArgs,
}

impl ServerSettings {
    fn role_args(&self, kind: RoleKind) -> &[String] {
        match kind {
            RoleKind::Prefill => &self.args.prefill,
            RoleKind::Decode => &self.args.decode,
            _ => &[],
        }
    }
}

/// A fully derived process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Port the launched process answers `/health` on
    pub health_port: u16,
}

impl LaunchPlan {
    fn server(model_path: &str) -> Self {
        Self {
            program: "python3".to_string(),
            args: strings(&[
                "-m",
                "sglang.launch_server",
                "--model-path",
                model_path,
                "--host",
                "0.0.0.0",
                "--port",
                &SERVER_PORT.to_string(),
            ]),
            env: BTreeMap::new(),
            health_port: SERVER_PORT,
        }
    }

    fn arg(mut self, flag: &str, value: impl ToString) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    fn extend(mut self, args: &[String]) -> Self {
        self.args.extend_from_slice(args);
        self
    }

    /// Shell-style rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// Copy `args`, replacing the value of `--node-rank` with `rank`.
fn with_node_rank(args: &[String], rank: u32) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--node-rank" {
            out.push(arg.clone());
            out.push(rank.to_string());
            iter.next();
        } else if arg.starts_with("--node-rank=") {
            out.push(format!("--node-rank={rank}"));
        } else {
            out.push(arg.clone());
        }
    }
    out
}

/// One pod, tensor parallel over all its NPUs.
pub fn single_plan(settings: &ServerSettings) -> LaunchPlan {
    LaunchPlan::server(&settings.model_path)
        .arg("--tp-size", settings.npus)
        .extend(&settings.args.extra)
}

/// A replica of the multi-node instance led by `master_ip`.
pub fn mix_plan(settings: &ServerSettings, ordinal: u32, master_ip: &str) -> LaunchPlan {
    LaunchPlan::server(&settings.model_path)
        .arg("--tp-size", settings.npus_per_pod * settings.replicas)
        .arg("--nnodes", settings.replicas)
        .arg("--node-rank", ordinal)
        .arg("--dist-init-addr", dist_init_addr(master_ip))
        .extend(&settings.args.extra)
}

/// Addresses a prefill or decode pod resolved before launching.
#[derive(Debug, Clone, Copy)]
pub struct DisaggregatedPeers<'a> {
    pub own_ip: &'a str,
    /// Ordinal-0 pod of the pod's own role
    pub role_leader_ip: &'a str,
    pub prefill_leader_ip: &'a str,
}

/// A prefill or decode server.
///
/// A multi-node role joins its leader's instance; an independent pod leads its own.
/// `--dist-init-addr` follows suit: the role leader's IP for a multi-node role,
/// the pod's own IP otherwise.
pub fn disaggregated_plan(
    settings: &ServerSettings,
    kind: RoleKind,
    ordinal: u32,
    peers: DisaggregatedPeers<'_>,
) -> LaunchPlan {
    let static_args = settings.role_args(kind);
    let multi_node = is_multi_node(static_args);
    let leader_ip = if multi_node {
        peers.role_leader_ip
    } else {
        peers.own_ip
    };

    let mut plan = LaunchPlan::server(&settings.model_path)
        .arg("--disaggregation-mode", kind.segment())
        .arg("--disaggregation-transfer-backend", TRANSFER_BACKEND)
        .arg("--dist-init-addr", dist_init_addr(leader_ip));
    if kind == RoleKind::Prefill {
        plan = plan.arg(
            "--disaggregation-bootstrap-port",
            bootstrap_port(static_args, ordinal),
        );
    }
    let mut plan = plan
        .extend(&with_node_rank(static_args, ordinal))
        .extend(&settings.args.extra);
    plan.env.insert(
        STORE_URL_ENV.to_string(),
        transfer_store_url(peers.prefill_leader_ip),
    );
    plan
}

/// Instances the router fronts: every pod of an independent role, only the
/// leader of a multi-node role.
fn instances<'a>(peers: &'a [Peer], static_args: &[String]) -> impl Iterator<Item = &'a Peer> {
    let leaders_only = is_multi_node(static_args);
    peers
        .iter()
        .filter(move |peer| !leaders_only || peer.ordinal == 0)
}

/// `ip:port` pairs that must accept connections before the router starts.
pub fn router_upstreams(settings: &ServerSettings, prefill: &[Peer], decode: &[Peer]) -> Vec<String> {
    let prefill_args = settings.role_args(RoleKind::Prefill);
    let decode_args = settings.role_args(RoleKind::Decode);
    instances(prefill, prefill_args)
        .map(|peer| format!("{}:{}", peer.ip, bootstrap_port(prefill_args, peer.ordinal)))
        .chain(instances(decode, decode_args).map(|peer| format!("{}:{SERVER_PORT}", peer.ip)))
        .collect()
}

/// The PD router over every discovered instance.
pub fn router_plan(settings: &ServerSettings, prefill: &[Peer], decode: &[Peer]) -> LaunchPlan {
    let prefill_args = settings.role_args(RoleKind::Prefill);
    let decode_args = settings.role_args(RoleKind::Decode);

    let mut args = strings(&["-m", "sglang_router.launch_router", "--pd-disaggregation"]);
    for peer in instances(prefill, prefill_args) {
        args.push("--prefill".to_string());
        args.push(format!("http://{}:{SERVER_PORT}", peer.ip));
        args.push(bootstrap_port(prefill_args, peer.ordinal).to_string());
    }
    for peer in instances(decode, decode_args) {
        args.push("--decode".to_string());
        args.push(format!("http://{}:{SERVER_PORT}", peer.ip));
    }
    args.extend(strings(&["--host", "0.0.0.0", "--port", &ROUTER_PORT.to_string()]));

    LaunchPlan {
        program: "python3".to_string(),
        args,
        env: BTreeMap::new(),
        health_port: ROUTER_PORT,
    }
}
