//! RPC lifecycle instrumentation.
//!
//! Transports report the progress of every call through a [StatsHandler]. Before any other event
//! for a call fires, [StatsHandler::tag_rpc] is given the call's extensions (the per-call context
//! that travels with the request) and may stash a value there. Every following event for that
//! call is delivered together with the same extensions, which is the only way to tell which call
//! an event belongs to.

mod handler;
mod layer;
mod results;

pub use handler::{CallStatsHandler, StatsHandlerOptions, StatsHandlerOptionsBuilder};
pub use layer::{RequestBody, ResponseFuture, StatsBody, StatsLayer, StatsSvc};
pub use results::{CallResults, ResultsBuffer};

use derive_more::{Display, From};
use http::Extensions;
use std::{error::Error, net::SocketAddr, time::Duration, time::Instant};
use uuid::Uuid;

/// Boxed error carried by a call's terminal event
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Receives lifecycle events from a transport. Implementations are invoked synchronously on the
/// transport's own tasks and must not block.
pub trait StatsHandler: Send + Sync {
    /// Called once per call, before any [RpcStats] event for it
    fn tag_rpc(&self, ctx: &mut Extensions, info: &RpcTagInfo);

    /// Called for every lifecycle event of a call, with the extensions [StatsHandler::tag_rpc]
    /// was given
    fn handle_rpc(&self, ctx: &Extensions, stats: RpcStats);

    /// Called when a connection is established
    fn tag_conn(&self, _ctx: &mut Extensions, _info: &ConnTagInfo) {}

    /// Called for connection level events
    fn handle_conn(&self, _ctx: &Extensions, _stats: &ConnStats) {}
}

/// Opaque per-call key into a handler's table of in-flight calls
#[derive(Clone, Copy, Debug, Display, From, Hash, PartialEq, Eq)]
pub struct CorrelationToken(Uuid);

/// Information available when a call is tagged
#[derive(Clone, Debug)]
pub struct RpcTagInfo {
    /// Full method path, ex: `/pkg.Svc/Method`
    pub full_method_name: String,
}

/// Information available when a connection is tagged
#[derive(Clone, Debug, Default)]
pub struct ConnTagInfo {
    /// Address of the server, if known
    pub remote_addr: Option<SocketAddr>,
    /// Local address of the connection, if known
    pub local_addr: Option<SocketAddr>,
}

/// Connection level event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnStats {
    /// The connection was established
    Begin,
    /// The connection was closed
    End,
}

/// One lifecycle event of a call. `End` is always the last event delivered for a call.
#[derive(Debug)]
pub enum RpcStats {
    /// The call has started
    Begin {
        /// When the call started, according to the transport
        begin_time: Instant,
    },
    /// Request headers were sent
    OutHeader,
    /// A request message was sent
    OutPayload {
        /// Encoded message length
        length: usize,
        sent_time: Instant,
    },
    /// Response headers were received
    InHeader,
    /// A response message was received
    InPayload {
        /// Encoded message length
        length: usize,
        recv_time: Instant,
    },
    /// Response trailers were received
    InTrailer,
    /// The call is finished
    End {
        /// Start time as seen by the transport. When present it's preferred over the locally
        /// recorded `Begin` time.
        begin_time: Option<Instant>,
        end_time: Instant,
        /// Set if the call failed
        error: Option<BoxError>,
    },
}

/// Wall clock timestamps of each phase of a call's lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimingRecord {
    /// When the call was tagged
    pub tagged_at: Instant,
    /// When the transport started the call
    pub begin: Option<Instant>,
    /// When request headers were sent
    pub out_header: Option<Instant>,
    /// Last request message sent
    pub out_payload: Option<Instant>,
    /// When response headers arrived
    pub in_header: Option<Instant>,
    /// Last response message received
    pub in_payload: Option<Instant>,
    /// When response trailers arrived
    pub in_trailer: Option<Instant>,
    /// Number of request messages sent
    pub out_payloads: u32,
    /// Number of response messages received
    pub in_payloads: u32,
}

impl TimingRecord {
    pub(crate) fn new(tagged_at: Instant) -> Self {
        Self {
            tagged_at,
            begin: None,
            out_header: None,
            out_payload: None,
            in_header: None,
            in_payload: None,
            in_trailer: None,
            out_payloads: 0,
            in_payloads: 0,
        }
    }
}

/// The outcome of one completed call
#[derive(Debug)]
pub struct CallResult {
    /// Which call this is
    pub token: CorrelationToken,
    /// Set if the call failed. Failures are a measured outcome, not an instrumentation problem.
    pub error: Option<BoxError>,
    /// Name of the gRPC status code carried by `error`, ex: `DeadlineExceeded`. Empty when there
    /// is no error or the error carries no status.
    pub status_code: String,
    /// Time from the start of the call until its end
    pub duration: Duration,
    /// Timestamps of every phase the call went through
    pub timing: TimingRecord,
}

/// Finds the gRPC status code name carried anywhere in `error`'s source chain
pub fn status_code_of(error: &(dyn Error + 'static)) -> String {
    let mut cur = Some(error);
    while let Some(e) = cur {
        if let Some(status) = e.downcast_ref::<tonic::Status>() {
            return format!("{:?}", status.code());
        }
        cur = e.source();
    }
    String::new()
}
