//! Network message types: the payload-bearing half of the protocol,
//! carried inside transport Frames.

use bytes::Bytes;
use picozen_core::id::ZenohId;

/// Network message ids (low 5 bits of the header).
pub mod mid {
    pub const DECLARE: u8 = 0x0B;
    pub const DATA: u8 = 0x0C;
    pub const QUERY: u8 = 0x0D;
    pub const PULL: u8 = 0x0E;
    pub const UNIT: u8 = 0x0F;
    /// Decorator preceding a Data or Unit reply body.
    pub const REPLY_CONTEXT: u8 = 0x1E;
}

/// Network message flags (high 3 bits of the header).
pub mod flag {
    /// Keyexpr suffix is present as a string.
    pub const K: u8 = 0x80;
    /// DataInfo present (Data).
    pub const I: u8 = 0x40;
    /// Droppable for congestion control (Data/Unit).
    pub const D: u8 = 0x20;
    /// Query payload present (Query).
    pub const B: u8 = 0x40;
    /// Query target present (Query).
    pub const T: u8 = 0x20;
    /// Max samples present (Pull).
    pub const N: u8 = 0x40;
    /// Final marker (Pull, ReplyContext).
    pub const F: u8 = 0x20;
    /// SubInfo present (Subscriber declaration).
    pub const S: u8 = 0x40;
    /// Reliable subscription (Subscriber declaration).
    pub const R: u8 = 0x20;
    /// Queryable info present (Queryable declaration).
    pub const Q: u8 = 0x40;
    /// Period present (SubInfo header).
    pub const P: u8 = 0x80;
}

/// Declaration ids within a Declare body.
pub mod decl_id {
    pub const RESOURCE: u8 = 0x01;
    pub const PUBLISHER: u8 = 0x02;
    pub const SUBSCRIBER: u8 = 0x03;
    pub const QUERYABLE: u8 = 0x04;
    pub const FORGET_RESOURCE: u8 = 0x11;
    pub const FORGET_PUBLISHER: u8 = 0x12;
    pub const FORGET_SUBSCRIBER: u8 = 0x13;
    pub const FORGET_QUERYABLE: u8 = 0x14;
}

/// A keyexpr as cited on the wire: a numeric resource alias plus an
/// optional suffix. `scope == 0` means the suffix stands alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireExpr {
    pub scope: u64,
    pub suffix: String,
}

impl WireExpr {
    #[must_use]
    pub fn literal(suffix: impl Into<String>) -> Self {
        Self {
            scope: 0,
            suffix: suffix.into(),
        }
    }

    #[must_use]
    pub const fn aliased(scope: u64, suffix: String) -> Self {
        Self { scope, suffix }
    }

    #[must_use]
    pub fn has_suffix(&self) -> bool {
        !self.suffix.is_empty()
    }
}

/// Payload encoding: a well-known numeric prefix plus a free suffix,
/// `"<mime>;<suffix>"` in string form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encoding {
    pub prefix: u64,
    pub suffix: String,
}

impl Encoding {
    pub const ZENOH_BYTES: u64 = 0;
    pub const APP_OCTET_STREAM: u64 = 1;
    pub const TEXT_PLAIN: u64 = 2;
    pub const APP_JSON: u64 = 3;
    pub const TEXT_JSON: u64 = 4;

    #[must_use]
    pub const fn new(prefix: u64) -> Self {
        Self {
            prefix,
            suffix: String::new(),
        }
    }

    #[must_use]
    pub fn application_json() -> Self {
        Self::new(Self::APP_JSON)
    }

    #[must_use]
    pub fn mime(&self) -> &'static str {
        match self.prefix {
            Self::APP_OCTET_STREAM => "application/octet-stream",
            Self::TEXT_PLAIN => "text/plain",
            Self::APP_JSON => "application/json",
            Self::TEXT_JSON => "text/json",
            _ => "zenoh/bytes",
        }
    }
}

/// NTP64-style timestamp paired with the stamping endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub time: u64,
    pub id: ZenohId,
}

/// Optional metadata attached to a Data payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataInfo {
    /// 0 = PUT, 1 = DELETE. Absent defaults to PUT.
    pub kind: Option<u64>,
    pub encoding: Option<Encoding>,
    pub timestamp: Option<Timestamp>,
    pub source_id: Option<ZenohId>,
    pub source_sn: Option<u64>,
}

pub mod data_info_flag {
    pub const KIND: u64 = 1 << 1;
    pub const ENCODING: u64 = 1 << 2;
    pub const TIMESTAMP: u64 = 1 << 3;
    pub const SOURCE_ID: u64 = 1 << 7;
    pub const SOURCE_SN: u64 = 1 << 8;
}

impl DataInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.encoding.is_none()
            && self.timestamp.is_none()
            && self.source_id.is_none()
            && self.source_sn.is_none()
    }

    #[must_use]
    pub fn options(&self) -> u64 {
        let mut opts = 0;
        if self.kind.is_some() {
            opts |= data_info_flag::KIND;
        }
        if self.encoding.is_some() {
            opts |= data_info_flag::ENCODING;
        }
        if self.timestamp.is_some() {
            opts |= data_info_flag::TIMESTAMP;
        }
        if self.source_id.is_some() {
            opts |= data_info_flag::SOURCE_ID;
        }
        if self.source_sn.is_some() {
            opts |= data_info_flag::SOURCE_SN;
        }
        opts
    }
}

/// Subscription mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubMode {
    #[default]
    Push,
    Pull,
}

/// Delivery guarantee requested by a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    #[default]
    Reliable,
    BestEffort,
}

/// Periodic subscription shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub origin: u64,
    pub period: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubInfo {
    pub mode: SubMode,
    pub reliability: Reliability,
    pub period: Option<Period>,
}

/// Queryable completeness advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryableInfo {
    pub complete: u64,
    pub distance: u64,
}

impl Default for QueryableInfo {
    fn default() -> Self {
        Self {
            complete: 0,
            distance: 0,
        }
    }
}

/// One declaration inside a Declare message. Declarations are
/// idempotent: a Forget for an unknown entity is a silent no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Resource { rid: u64, key: WireExpr },
    ForgetResource { rid: u64 },
    Publisher { key: WireExpr },
    ForgetPublisher { key: WireExpr },
    Subscriber { key: WireExpr, info: SubInfo },
    ForgetSubscriber { key: WireExpr },
    Queryable { key: WireExpr, info: QueryableInfo },
    ForgetQueryable { key: WireExpr },
}

/// Where a query is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTarget {
    #[default]
    BestMatching,
    All,
    AllComplete,
}

impl QueryTarget {
    #[must_use]
    pub const fn to_wire(self) -> u64 {
        match self {
            Self::BestMatching => 0,
            Self::All => 1,
            Self::AllComplete => 2,
        }
    }

    #[must_use]
    pub const fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::BestMatching),
            1 => Some(Self::All),
            2 => Some(Self::AllComplete),
            _ => None,
        }
    }
}

/// How replies to one query are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsolidationMode {
    None,
    Monotonic,
    Latest,
    #[default]
    Auto,
}

impl ConsolidationMode {
    #[must_use]
    pub const fn to_wire(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Monotonic => 1,
            Self::Latest => 2,
            Self::Auto => 3,
        }
    }

    #[must_use]
    pub const fn from_wire(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Monotonic),
            2 => Some(Self::Latest),
            3 => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Reply decorator binding a Data/Unit body to a pending query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub qid: u64,
    /// Absent on the final marker.
    pub replier_id: Option<ZenohId>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub key: WireExpr,
    pub info: Option<DataInfo>,
    pub payload: Bytes,
    pub droppable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pull {
    pub key: WireExpr,
    pub pull_id: u64,
    pub max_samples: Option<u64>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub key: WireExpr,
    pub parameters: String,
    pub qid: u64,
    pub target: QueryTarget,
    pub consolidation: ConsolidationMode,
    pub payload: Option<(DataInfo, Bytes)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkBody {
    Declare { declarations: Vec<Declaration> },
    Data(Data),
    Unit { droppable: bool },
    Pull(Pull),
    Query(Query),
}

/// A network message: a body plus the optional reply decorator. The
/// decorator is only meaningful on Data and Unit bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMessage {
    pub body: NetworkBody,
    pub reply_context: Option<ReplyContext>,
}

impl NetworkMessage {
    #[must_use]
    pub const fn new(body: NetworkBody) -> Self {
        Self {
            body,
            reply_context: None,
        }
    }

    #[must_use]
    pub fn make_declare(declarations: Vec<Declaration>) -> Self {
        Self::new(NetworkBody::Declare { declarations })
    }

    #[must_use]
    pub fn make_data(
        key: WireExpr,
        info: Option<DataInfo>,
        payload: Bytes,
        droppable: bool,
    ) -> Self {
        Self::new(NetworkBody::Data(Data {
            key,
            info,
            payload,
            droppable,
        }))
    }

    #[must_use]
    pub fn make_unit(droppable: bool) -> Self {
        Self::new(NetworkBody::Unit { droppable })
    }

    #[must_use]
    pub fn make_pull(
        key: WireExpr,
        pull_id: u64,
        max_samples: Option<u64>,
        is_final: bool,
    ) -> Self {
        Self::new(NetworkBody::Pull(Pull {
            key,
            pull_id,
            max_samples,
            is_final,
        }))
    }

    #[must_use]
    pub fn make_query(query: Query) -> Self {
        Self::new(NetworkBody::Query(query))
    }

    /// A Data reply bound to `qid`.
    #[must_use]
    pub fn make_reply(qid: u64, replier_id: ZenohId, data: Data) -> Self {
        Self {
            body: NetworkBody::Data(data),
            reply_context: Some(ReplyContext {
                qid,
                replier_id: Some(replier_id),
                is_final: false,
            }),
        }
    }

    /// The final marker closing the reply stream of `qid`.
    #[must_use]
    pub fn make_reply_final(qid: u64) -> Self {
        Self {
            body: NetworkBody::Unit { droppable: false },
            reply_context: Some(ReplyContext {
                qid,
                replier_id: None,
                is_final: true,
            }),
        }
    }
}
