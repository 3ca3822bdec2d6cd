//! Domain models for synced browser data

mod account;
mod clients;
mod history;
mod meta;
mod record;
mod site;
mod tabs;

pub use account::{KeyBundle, Keys, TokenServerToken};
pub use clients::{ClientCommand, ClientPayload, CommandPayload, RemoteClient, SUPPORTED_PROTOCOLS};
pub use history::{HISTORY_SORTINDEX, HISTORY_TTL_SECONDS, HistoryPayload, make_history_record};
pub use meta::{EngineMeta, InfoCollections, MetaGlobal, STORAGE_VERSION};
pub use record::{Guid, MicrosecondTimestamp, Record, Timestamp, now_micros, now_millis};
pub use site::{Place, Site, SiteVisit, Visit, VisitType, is_ignored_url, normalized_host};
pub use tabs::{
    ClientAndTabs, RemoteTab, TabPayload, TabsPayload, decimal_seconds_to_millis, decode_tab_history,
    encode_tab_history, millis_to_decimal_seconds,
};
