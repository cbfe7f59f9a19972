//! DNS authority for the private suffix, with upstream forwarding.
//!
//! The server answers authoritatively for names under the private suffix
//! (default `container.`) out of the latest instance-view snapshot and
//! proxies every other query to the host's configured resolvers, first
//! successful response verbatim. Answer shapes:
//!
//! - `A`/`AAAA <ordinal>.<service>.<group>.<suffix>`: the instance's
//!   addresses, one record per address of the matching family.
//! - `A`/`AAAA <service>.<group>.<suffix>`: addresses of every live
//!   instance of the service.
//! - `SRV <port>.<ordinal>.<service>.<group>.<suffix>`: the host port the
//!   container port is mapped to, target `<ordinal>.<service>.<group>.<suffix>`.
//!
//! Anything else under the suffix, including unknown instances, gets an
//! empty NoError answer, and all records carry TTL 0: the table can change
//! between any two queries. Signed requests get signed responses when a
//! TSIG key is configured and the request's signature validates.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::rdata::SRV;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::instance::Instance;
use crate::sink::ErrorSink;
use crate::view::Snapshot;

/// Default private suffix.
pub const DEFAULT_SUFFIX: &str = "container";

/// How long to wait on one upstream before trying the next.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Large enough for EDNS-sized UDP queries.
const UDP_BUFFER: usize = 4096;

/// Upstream resolvers for non-authoritative queries.
pub struct Upstreams {
    servers: Vec<SocketAddr>,
}

impl Upstreams {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self { servers }
    }

    /// Read the host resolver configuration (`/etc/resolv.conf`).
    pub fn from_resolv_conf(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read resolver config {}", path.display()))?;
        let config = resolv_conf::Config::parse(&text)
            .with_context(|| format!("parse resolver config {}", path.display()))?;

        let servers = config
            .nameservers
            .iter()
            .map(|scoped| {
                let ip = match scoped {
                    resolv_conf::ScopedIp::V4(ip) => std::net::IpAddr::V4(*ip),
                    resolv_conf::ScopedIp::V6(ip, _) => std::net::IpAddr::V6(*ip),
                };
                SocketAddr::new(ip, 53)
            })
            .collect();
        Ok(Self { servers })
    }

    /// Proxy a raw query, first successful upstream response wins.
    async fn forward(&self, raw: &[u8], over_tcp: bool) -> Result<Vec<u8>> {
        let mut last_err = anyhow::anyhow!("no upstream resolvers configured");
        for server in &self.servers {
            let attempt = if over_tcp {
                forward_tcp(*server, raw).await
            } else {
                forward_udp(*server, raw).await
            };
            match attempt {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(upstream = %server, error = %err, "Upstream failed, trying next");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

async fn forward_udp(server: SocketAddr, raw: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.send_to(raw, server).await?;

    let mut buf = vec![0u8; UDP_BUFFER];
    let (len, _) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("upstream timed out")??;
    buf.truncate(len);
    Ok(buf)
}

async fn forward_tcp(server: SocketAddr, raw: &[u8]) -> Result<Vec<u8>> {
    let work = async {
        let mut stream = TcpStream::connect(server).await?;
        stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
        stream.write_all(raw).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut buf).await?;
        Ok::<_, anyhow::Error>(buf)
    };
    tokio::time::timeout(UPSTREAM_TIMEOUT, work)
        .await
        .context("upstream timed out")?
}

/// Build a TSIG signer from a key name and base64 secret (HMAC-SHA256).
pub fn tsig_signer(key_name: &str, secret_base64: &str) -> Result<TSigner> {
    let key = base64::engine::general_purpose::STANDARD
        .decode(secret_base64)
        .context("decode TSIG secret")?;
    let name = Name::from_utf8(key_name).context("parse TSIG key name")?;
    TSigner::new(key, TsigAlgorithm::HmacSha256, name, 300)
        .map_err(|err| anyhow::anyhow!("construct TSIG signer: {err}"))
}

/// Everything a query handler needs, cheap to clone per packet.
#[derive(Clone)]
struct HandlerContext {
    suffix: String,
    table: watch::Receiver<Snapshot<Instance>>,
    upstreams: Arc<Upstreams>,
    tsig: Option<Arc<TSigner>>,
}

/// Run the DNS server until shutdown.
///
/// Binds TCP and UDP on `addr`; a bind failure is reported to the error
/// sink and disables this subsystem without taking the agent down.
pub async fn run_dns_server(
    addr: SocketAddr,
    suffix: String,
    mut instances_rx: mpsc::Receiver<Snapshot<Instance>>,
    upstreams: Upstreams,
    tsig: Option<TSigner>,
    errors: ErrorSink,
    mut shutdown: watch::Receiver<bool>,
) {
    let udp = match UdpSocket::bind(addr).await {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            errors.report(anyhow::Error::from(err).context(format!("bind udp {addr}"))).await;
            return;
        }
    };
    let tcp = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            errors.report(anyhow::Error::from(err).context(format!("bind tcp {addr}"))).await;
            return;
        }
    };
    info!(addr = %addr, suffix = %suffix, "DNS server listening");

    // Single subscriber task owns the snapshot slot; handlers only borrow.
    let (table_tx, table_rx) = watch::channel(Snapshot::default());
    let mut sub_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sub_shutdown.changed() => {
                    if *sub_shutdown.borrow() {
                        break;
                    }
                }
                snapshot = instances_rx.recv() => match snapshot {
                    Some(snapshot) => {
                        debug!(hosts = snapshot.len(), "DNS table updated");
                        if table_tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    let ctx = HandlerContext {
        suffix: suffix.trim_matches('.').to_ascii_lowercase(),
        table: table_rx,
        upstreams: Arc::new(upstreams),
        tsig: tsig.map(Arc::new),
    };

    let mut udp_shutdown = shutdown.clone();
    let udp_ctx = ctx.clone();
    let udp_task = tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_BUFFER];
        loop {
            tokio::select! {
                _ = udp_shutdown.changed() => {
                    if *udp_shutdown.borrow() {
                        break;
                    }
                }
                received = udp.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(ok) => ok,
                        Err(err) => {
                            warn!(error = %err, "UDP receive failed");
                            continue;
                        }
                    };
                    let raw = buf[..len].to_vec();
                    let socket = Arc::clone(&udp);
                    let ctx = udp_ctx.clone();
                    tokio::spawn(async move {
                        if let Some(response) = handle_packet(&raw, &ctx, false).await {
                            if let Err(err) = socket.send_to(&response, peer).await {
                                debug!(peer = %peer, error = %err, "UDP send failed");
                            }
                        }
                    });
                }
            }
        }
    });

    let mut tcp_shutdown = shutdown.clone();
    let tcp_ctx = ctx;
    let tcp_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tcp_shutdown.changed() => {
                    if *tcp_shutdown.borrow() {
                        break;
                    }
                }
                accepted = tcp.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(ok) => ok,
                        Err(err) => {
                            warn!(error = %err, "TCP accept failed");
                            continue;
                        }
                    };
                    let ctx = tcp_ctx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_tcp_connection(stream, &ctx).await {
                            debug!(peer = %peer, error = %err, "TCP connection ended");
                        }
                    });
                }
            }
        }
    });

    let _ = shutdown.changed().await;
    udp_task.abort();
    tcp_task.abort();
    debug!("DNS server exiting");
}

async fn serve_tcp_connection(mut stream: TcpStream, ctx: &HandlerContext) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // client closed
        }
        let mut raw = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut raw).await?;

        if let Some(response) = handle_packet(&raw, ctx, true).await {
            stream
                .write_all(&(response.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&response).await?;
        }
    }
}

/// Dispatch one raw query: authoritative if any question falls under the
/// private suffix, proxied otherwise. `None` drops the packet.
async fn handle_packet(raw: &[u8], ctx: &HandlerContext, over_tcp: bool) -> Option<Vec<u8>> {
    let request = match Message::from_vec(raw) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "Dropping unparseable query");
            return None;
        }
    };

    let private = request
        .queries()
        .iter()
        .any(|q| name_under_suffix(q.name(), &ctx.suffix));

    if private {
        let table = ctx.table.borrow().clone();
        let response = answer_private(&request, raw, &table, ctx);
        return response.to_vec().ok();
    }

    match ctx.upstreams.forward(raw, over_tcp).await {
        Ok(response) => Some(response),
        Err(err) => {
            debug!(error = %err, "All upstreams failed");
            None
        }
    }
}

/// Does the queried name end in the private suffix?
fn name_under_suffix(name: &Name, suffix: &str) -> bool {
    name.iter()
        .last()
        .is_some_and(|label| label.eq_ignore_ascii_case(suffix.as_bytes()))
}

/// Build the authoritative response for a private query.
fn answer_private(
    request: &Message,
    raw_request: &[u8],
    table: &BTreeMap<String, Instance>,
    ctx: &HandlerContext,
) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_response_code(ResponseCode::NoError);

    for query in request.queries() {
        response.add_query(query.clone());
        for record in answer_question(query, table, &ctx.suffix) {
            response.add_answer(record);
        }
    }

    if let Some(signer) = &ctx.tsig {
        maybe_sign(&mut response, raw_request, request, signer);
    }
    response
}

/// Sign the response when the request carried a valid signature. A failed
/// validation or signing leaves the response unsigned rather than dropping
/// it.
fn maybe_sign(response: &mut Message, raw_request: &[u8], request: &Message, signer: &TSigner) {
    if request.signature().is_empty() {
        return;
    }
    if let Err(err) = signer.verify_message_byte(None, raw_request, true) {
        debug!(error = %err, "Request TSIG did not validate, leaving response unsigned");
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    if let Err(err) = response.finalize(signer, now) {
        warn!(error = %err, "Failed to sign response");
    }
}

/// Records answering one question from the instance table.
fn answer_question(
    query: &Query,
    table: &BTreeMap<String, Instance>,
    suffix: &str,
) -> Vec<Record> {
    let name = query.name();
    let labels: Vec<String> = name
        .iter()
        .map(|l| String::from_utf8_lossy(l).to_ascii_lowercase())
        .collect();
    let Some((last, body)) = labels.split_last() else {
        return Vec::new();
    };
    if last != suffix {
        return Vec::new();
    }

    match query.query_type() {
        RecordType::A | RecordType::AAAA => {
            let instances: Vec<&Instance> = match body {
                // <ordinal>.<service>.<group>
                [ordinal, service, group] => table
                    .get(&format!("{ordinal}.{service}.{group}"))
                    .into_iter()
                    .collect(),
                // <service>.<group>: every instance of the service
                [service, group] => table
                    .values()
                    .filter(|i| i.service == *service && i.group == *group)
                    .collect(),
                _ => Vec::new(),
            };

            let mut records = Vec::new();
            for instance in instances {
                for addr in &instance.addrs {
                    let rdata = match (query.query_type(), addr) {
                        (RecordType::A, std::net::IpAddr::V4(v4)) => RData::A((*v4).into()),
                        (RecordType::AAAA, std::net::IpAddr::V6(v6)) => RData::AAAA((*v6).into()),
                        _ => continue,
                    };
                    records.push(Record::from_rdata(name.clone(), 0, rdata));
                }
            }
            records
        }

        RecordType::SRV => {
            // Most specific shape only:
            // <container-port>.<ordinal>.<service>.<group>.<suffix>
            let [port, ordinal, service, group] = body else {
                return Vec::new();
            };
            let Some(instance) = table.get(&format!("{ordinal}.{service}.{group}")) else {
                return Vec::new();
            };
            let Some(host_port) = instance
                .port_mappings
                .get(port.as_str())
                .and_then(|p| p.parse::<u16>().ok())
            else {
                return Vec::new();
            };

            // Target: the instance name, i.e. everything after the port
            // label.
            let target = name.trim_to(4);
            vec![Record::from_rdata(
                name.clone(),
                0,
                RData::SRV(SRV::new(0, 0, host_port, target)),
            )]
        }

        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn instance(group: &str, service: &str, ordinal: u32, addrs: &[&str]) -> Instance {
        let mut instance = Instance {
            group: group.into(),
            service: service.into(),
            ordinal,
            addrs: addrs.iter().map(|a| a.parse::<IpAddr>().unwrap()).collect(),
            ..Default::default()
        };
        instance
            .port_mappings
            .insert("8080".into(), "49153".into());
        instance
    }

    fn table(instances: Vec<Instance>) -> BTreeMap<String, Instance> {
        instances
            .into_iter()
            .map(|i| (i.qualified_name(), i))
            .collect()
    }

    fn query(name: &str, rtype: RecordType) -> Query {
        Query::query(Name::from_utf8(name).unwrap(), rtype)
    }

    fn a_addrs(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) => Some(a.to_string()),
                Some(RData::AAAA(a)) => Some(a.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_a_query_for_instance() {
        let table = table(vec![instance("g1", "web", 0, &["10.0.0.5"])]);
        let records = answer_question(&query("0.web.g1.container.", RecordType::A), &table, "container");

        assert_eq!(a_addrs(&records), vec!["10.0.0.5"]);
        assert!(records.iter().all(|r| r.ttl() == 0));
    }

    #[test]
    fn test_a_query_filters_families() {
        let table = table(vec![instance("g1", "web", 0, &["10.0.0.5", "fd00::1"])]);

        let a = answer_question(&query("0.web.g1.container.", RecordType::A), &table, "container");
        assert_eq!(a_addrs(&a), vec!["10.0.0.5"]);

        let aaaa = answer_question(&query("0.web.g1.container.", RecordType::AAAA), &table, "container");
        assert_eq!(a_addrs(&aaaa), vec!["fd00::1"]);
    }

    #[test]
    fn test_service_wide_a_query() {
        let table = table(vec![
            instance("g1", "web", 0, &["10.0.0.5"]),
            instance("g1", "web", 1, &["10.0.0.6"]),
            instance("g1", "db", 0, &["10.0.0.7"]),
        ]);

        let records = answer_question(&query("web.g1.container.", RecordType::A), &table, "container");
        let mut addrs = a_addrs(&records);
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.5", "10.0.0.6"]);
    }

    #[test]
    fn test_unknown_name_is_empty_not_error() {
        let table = table(vec![]);
        let records = answer_question(&query("0.web.g1.container.", RecordType::A), &table, "container");
        assert!(records.is_empty());
    }

    #[test]
    fn test_srv_query_maps_port() {
        let table = table(vec![instance("g1", "web", 0, &["10.0.0.5"])]);
        let records = answer_question(
            &query("8080.0.web.g1.container.", RecordType::SRV),
            &table,
            "container",
        );

        assert_eq!(records.len(), 1);
        let Some(RData::SRV(srv)) = records[0].data() else {
            panic!("expected SRV rdata");
        };
        assert_eq!(srv.port(), 49153);
        assert_eq!(srv.target().to_utf8(), "0.web.g1.container.");
    }

    #[test]
    fn test_srv_unknown_port_is_empty() {
        let table = table(vec![instance("g1", "web", 0, &["10.0.0.5"])]);
        let records = answer_question(
            &query("9999.0.web.g1.container.", RecordType::SRV),
            &table,
            "container",
        );
        assert!(records.is_empty());
    }

    #[test]
    fn test_srv_wrong_shape_fails_closed() {
        let table = table(vec![instance("g1", "web", 0, &["10.0.0.5"])]);
        for name in ["8080.web.g1.container.", "0.web.g1.container.", "a.8080.0.web.g1.container."] {
            let records = answer_question(&query(name, RecordType::SRV), &table, "container");
            assert!(records.is_empty(), "{name} should fail closed");
        }
    }

    #[test]
    fn test_suffix_match_is_case_insensitive() {
        let name = Name::from_utf8("0.web.g1.CONTAINER.").unwrap();
        assert!(name_under_suffix(&name, "container"));
        let name = Name::from_utf8("example.com.").unwrap();
        assert!(!name_under_suffix(&name, "container"));
    }

    #[test]
    fn test_private_response_shape() {
        let table = table(vec![instance("g1", "web", 0, &["10.0.0.5"])]);
        let (_tx, rx) = watch::channel(Snapshot::default());
        let ctx = HandlerContext {
            suffix: "container".into(),
            table: rx,
            upstreams: Arc::new(Upstreams::new(vec![])),
            tsig: None,
        };

        let mut request = Message::new();
        request.set_id(77);
        request.add_query(query("nope.web.g1.container.", RecordType::A));
        let raw = request.to_vec().unwrap();

        let response = answer_private(&request, &raw, &table, &ctx);
        assert_eq!(response.id(), 77);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.queries().len(), 1);
        assert!(response.answers().is_empty());
    }

    #[test]
    fn test_resolv_conf_parsing() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 10.0.0.2\nnameserver 10.0.0.3\nsearch example.com").unwrap();

        let upstreams = Upstreams::from_resolv_conf(file.path()).unwrap();
        assert_eq!(
            upstreams.servers,
            vec!["10.0.0.2:53".parse::<SocketAddr>().unwrap(), "10.0.0.3:53".parse().unwrap()]
        );
    }
}
