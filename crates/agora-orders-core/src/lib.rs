#![allow(clippy::missing_errors_doc)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("invalid unix timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Lifecycle of an order, shared with dispute cases. Stored as a small
/// integer; the numeric values are part of the on-disk row format and must
/// not be reordered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    AwaitingPayment,
    AwaitingPickup,
    AwaitingFulfillment,
    PartiallyFulfilled,
    Fulfilled,
    Completed,
    Canceled,
    Declined,
    Refunded,
    Disputed,
    Decided,
    Resolved,
    PaymentFinalized,
}

impl OrderState {
    #[must_use]
    pub fn to_int(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::AwaitingPayment => 1,
            Self::AwaitingPickup => 2,
            Self::AwaitingFulfillment => 3,
            Self::PartiallyFulfilled => 4,
            Self::Fulfilled => 5,
            Self::Completed => 6,
            Self::Canceled => 7,
            Self::Declined => 8,
            Self::Refunded => 9,
            Self::Disputed => 10,
            Self::Decided => 11,
            Self::Resolved => 12,
            Self::PaymentFinalized => 13,
        }
    }

    #[must_use]
    pub fn from_int(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::AwaitingPayment),
            2 => Some(Self::AwaitingPickup),
            3 => Some(Self::AwaitingFulfillment),
            4 => Some(Self::PartiallyFulfilled),
            5 => Some(Self::Fulfilled),
            6 => Some(Self::Completed),
            7 => Some(Self::Canceled),
            8 => Some(Self::Declined),
            9 => Some(Self::Refunded),
            10 => Some(Self::Disputed),
            11 => Some(Self::Decided),
            12 => Some(Self::Resolved),
            13 => Some(Self::PaymentFinalized),
            _ => None,
        }
    }

    /// True once the record can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Canceled
                | Self::Declined
                | Self::Refunded
                | Self::Resolved
                | Self::PaymentFinalized
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Direct,
    AddressRequest,
    Moderated,
}

/// The structured agreement document embedded in purchase and case records.
/// Buyer and vendor each contribute their half asynchronously; every field
/// tolerates absence so a partially assembled contract still round-trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Contract {
    pub vendor_listings: Vec<Listing>,
    pub buyer_order: Option<Order>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Listing {
    pub slug: String,
    pub item: Option<ListingItem>,
    pub vendor_id: Option<PeerInfo>,
    pub moderators: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingItem {
    pub title: String,
    pub images: Vec<ListingImage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingImage {
    pub tiny: String,
    pub small: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerInfo {
    pub peer_id: String,
    pub handle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Order {
    pub buyer_id: Option<PeerInfo>,
    pub shipping: Option<Shipping>,
    pub timestamp: i64,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Shipping {
    pub ship_to: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Payment {
    pub amount: u64,
    pub method: PaymentMethod,
    pub address: String,
    pub moderator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DisputeResolution {
    pub timestamp: i64,
    pub proposed_by: String,
    pub resolution: String,
}

impl Contract {
    /// Order creation time in unix seconds, 0 when the order half is absent.
    #[must_use]
    pub fn order_timestamp(&self) -> i64 {
        self.buyer_order.as_ref().map_or(0, |order| order.timestamp)
    }

    #[must_use]
    pub fn order_total(&self) -> u64 {
        self.buyer_order
            .as_ref()
            .and_then(|order| order.payment.as_ref())
            .map_or(0, |payment| payment.amount)
    }

    #[must_use]
    pub fn title(&self) -> &str {
        self.vendor_listings
            .first()
            .and_then(|listing| listing.item.as_ref())
            .map_or("", |item| item.title.as_str())
    }

    #[must_use]
    pub fn thumbnail(&self) -> &str {
        self.vendor_listings
            .first()
            .and_then(|listing| listing.item.as_ref())
            .and_then(|item| item.images.first())
            .map_or("", |image| image.tiny.as_str())
    }

    #[must_use]
    pub fn vendor_peer_id(&self) -> &str {
        self.vendor_listings
            .first()
            .and_then(|listing| listing.vendor_id.as_ref())
            .map_or("", |vendor| vendor.peer_id.as_str())
    }

    #[must_use]
    pub fn vendor_handle(&self) -> &str {
        self.vendor_listings
            .first()
            .and_then(|listing| listing.vendor_id.as_ref())
            .map_or("", |vendor| vendor.handle.as_str())
    }

    /// Lower-cased recipient name, the form stored for search.
    #[must_use]
    pub fn shipping_name(&self) -> String {
        self.buyer_order
            .as_ref()
            .and_then(|order| order.shipping.as_ref())
            .map_or_else(String::new, |shipping| shipping.ship_to.to_lowercase())
    }

    /// Lower-cased shipping address, the form stored for search.
    #[must_use]
    pub fn shipping_address(&self) -> String {
        self.buyer_order
            .as_ref()
            .and_then(|order| order.shipping.as_ref())
            .map_or_else(String::new, |shipping| shipping.address.to_lowercase())
    }

    #[must_use]
    pub fn payment_address(&self) -> &str {
        self.buyer_order
            .as_ref()
            .and_then(|order| order.payment.as_ref())
            .map_or("", |payment| payment.address.as_str())
    }

    /// Whether a dispute can structurally be opened against this contract:
    /// the payment must be moderated and name a moderator.
    #[must_use]
    pub fn is_disputeable(&self) -> bool {
        self.buyer_order
            .as_ref()
            .and_then(|order| order.payment.as_ref())
            .is_some_and(|payment| {
                payment.method == PaymentMethod::Moderated && !payment.moderator.is_empty()
            })
    }
}

/// A funding transaction output reference. `index` is omitted from the JSON
/// encoding when zero; existing rows were written that way and byte-level
/// compatibility is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Outpoint {
    pub hash: String,
    #[serde(default, skip_serializing_if = "index_is_zero")]
    pub index: u32,
    pub value: u64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn index_is_zero(index: &u32) -> bool {
    *index == 0
}

/// A ledger reference recorded when funding for an order is observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionRecord {
    pub txid: String,
    pub index: u32,
    pub value: i64,
}

/// A payment address in the canonical encoded form produced by the wallet.
/// Address decoding and network rules live with the wallet; this type only
/// carries the already-normalized string used as the secondary lookup key.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PaymentAddress(String);

impl PaymentAddress {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PaymentAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The slice of a purchase row the notification scheduler works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub order_id: String,
    pub contract: Contract,
    pub state: OrderState,
    pub timestamp: OffsetDateTime,
    pub last_notified_at: OffsetDateTime,
}

/// The slice of a dispute case row the notification scheduler works with.
/// Buyer and vendor contracts are independently nullable; either party may
/// never submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeCaseRecord {
    pub case_id: String,
    pub timestamp: OffsetDateTime,
    pub last_notified_at: OffsetDateTime,
    pub buyer_contract: Option<Contract>,
    pub vendor_contract: Option<Contract>,
    pub is_buyer_initiated: bool,
}

/// How old a never-notified record must be before its first reminder.
pub const FIRST_NOTICE_DELAY: Duration = Duration::days(15);
/// Minimum spacing between consecutive reminders for one record.
pub const RENOTIFY_COOLDOWN: Duration = Duration::days(1);
/// A notice sent this long after the record started is the final one; the
/// record is never selected again.
pub const NOTICE_WINDOW: Duration = Duration::days(45);

/// Whether `last_notified_at` still holds the "never notified" sentinel
/// (epoch zero or earlier).
#[must_use]
pub fn never_notified(last_notified_at: OffsetDateTime) -> bool {
    last_notified_at <= OffsetDateTime::UNIX_EPOCH
}

/// Reminder eligibility for a record that started at `started_at` and was
/// last reminded at `last_notified_at`.
///
/// A never-notified record becomes due [`FIRST_NOTICE_DELAY`] after it
/// started. A previously notified record is due again once
/// [`RENOTIFY_COOLDOWN`] has elapsed since its last notice, unless that
/// notice landed [`NOTICE_WINDOW`] or more after the start, which made it
/// the final one.
#[must_use]
pub fn notification_due(
    started_at: OffsetDateTime,
    last_notified_at: OffsetDateTime,
    now: OffsetDateTime,
) -> bool {
    if never_notified(last_notified_at) {
        return now - started_at >= FIRST_NOTICE_DELAY;
    }
    if last_notified_at - started_at >= NOTICE_WINDOW {
        return false;
    }
    now - last_notified_at >= RENOTIFY_COOLDOWN
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn from_unix_seconds(seconds: i64) -> Result<OffsetDateTime, DomainError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| DomainError::InvalidTimestamp(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_contract() -> Contract {
        Contract {
            vendor_listings: vec![Listing {
                slug: "test-listing".to_string(),
                item: Some(ListingItem {
                    title: "Test listing".to_string(),
                    images: vec![ListingImage {
                        tiny: "test image hash".to_string(),
                        small: "small image hash".to_string(),
                    }],
                }),
                vendor_id: Some(PeerInfo {
                    peer_id: "vendor id".to_string(),
                    handle: "@testvendor".to_string(),
                }),
                moderators: Vec::new(),
            }],
            buyer_order: Some(Order {
                buyer_id: Some(PeerInfo {
                    peer_id: "buyer id".to_string(),
                    handle: "@testbuyer".to_string(),
                }),
                shipping: Some(Shipping {
                    ship_to: "Buyer Name".to_string(),
                    address: "1234 Test Ave.".to_string(),
                }),
                timestamp: 1_500_000_000,
                payment: Some(Payment {
                    amount: 10,
                    method: PaymentMethod::Direct,
                    address: "PK5fSKzv5nGqzFT1mbEK21U8wf2Sj8QqQd".to_string(),
                    moderator: String::new(),
                }),
            }),
        }
    }

    #[test]
    fn order_state_int_mapping_round_trips() {
        for value in 0..14 {
            let state = match OrderState::from_int(value) {
                Some(state) => state,
                None => panic!("state {value} must be known"),
            };
            assert_eq!(state.to_int(), value);
        }
        assert_eq!(OrderState::from_int(14), None);
        assert_eq!(OrderState::from_int(-1), None);
    }

    #[test]
    fn terminal_states() {
        assert!(OrderState::Resolved.is_terminal());
        assert!(OrderState::Completed.is_terminal());
        assert!(!OrderState::Disputed.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
    }

    #[test]
    fn derived_display_fields_follow_contract() {
        let contract = fixture_contract();
        assert_eq!(contract.order_timestamp(), 1_500_000_000);
        assert_eq!(contract.order_total(), 10);
        assert_eq!(contract.title(), "Test listing");
        assert_eq!(contract.thumbnail(), "test image hash");
        assert_eq!(contract.vendor_peer_id(), "vendor id");
        assert_eq!(contract.vendor_handle(), "@testvendor");
        assert_eq!(contract.shipping_name(), "buyer name");
        assert_eq!(contract.shipping_address(), "1234 test ave.");
        assert_eq!(
            contract.payment_address(),
            "PK5fSKzv5nGqzFT1mbEK21U8wf2Sj8QqQd"
        );
    }

    #[test]
    fn derived_display_fields_default_when_halves_missing() {
        let contract = Contract::default();
        assert_eq!(contract.order_timestamp(), 0);
        assert_eq!(contract.order_total(), 0);
        assert_eq!(contract.title(), "");
        assert_eq!(contract.thumbnail(), "");
        assert_eq!(contract.shipping_name(), "");
        assert!(!contract.is_disputeable());
    }

    #[test]
    fn dispute_eligibility_requires_moderated_payment_with_moderator() {
        let mut contract = fixture_contract();
        assert!(!contract.is_disputeable());

        if let Some(order) = contract.buyer_order.as_mut() {
            if let Some(payment) = order.payment.as_mut() {
                payment.method = PaymentMethod::Moderated;
            }
        }
        assert!(!contract.is_disputeable());

        if let Some(order) = contract.buyer_order.as_mut() {
            if let Some(payment) = order.payment.as_mut() {
                payment.moderator = "moderator id".to_string();
            }
        }
        assert!(contract.is_disputeable());
    }

    #[test]
    fn outpoint_encoding_omits_zero_index() {
        let zero = vec![Outpoint {
            hash: "hash1".to_string(),
            index: 0,
            value: 5,
        }];
        let nonzero = vec![Outpoint {
            hash: "hash2".to_string(),
            index: 1,
            value: 11,
        }];
        assert_eq!(
            must_ok(serde_json::to_string(&zero)),
            r#"[{"hash":"hash1","value":5}]"#
        );
        assert_eq!(
            must_ok(serde_json::to_string(&nonzero)),
            r#"[{"hash":"hash2","index":1,"value":11}]"#
        );
    }

    #[test]
    fn outpoint_decoding_defaults_missing_index_to_zero() {
        let decoded: Vec<Outpoint> = must_ok(serde_json::from_str(r#"[{"hash":"hash1","value":5}]"#));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].index, 0);
        assert_eq!(decoded[0].value, 5);
    }

    #[test]
    fn contract_text_round_trips_with_defaults_emitted() {
        let contract = fixture_contract();
        let text = must_ok(serde_json::to_string_pretty(&contract));
        assert!(text.contains("\"vendorListings\""));
        assert!(text.contains("\"moderators\": []"));
        let decoded: Contract = must_ok(serde_json::from_str(&text));
        assert_eq!(decoded, contract);
    }

    fn must_utc(seconds: i64) -> OffsetDateTime {
        must_ok(from_unix_seconds(seconds))
    }

    #[test]
    fn never_notified_recognizes_epoch_sentinel() {
        assert!(never_notified(OffsetDateTime::UNIX_EPOCH));
        assert!(!never_notified(must_utc(1)));
    }

    #[test]
    fn young_record_without_notice_is_not_due() {
        let now = now_utc();
        let started = now - Duration::days(2);
        assert!(!notification_due(started, OffsetDateTime::UNIX_EPOCH, now));
    }

    #[test]
    fn old_record_without_notice_is_due() {
        let now = now_utc();
        let started = now - Duration::days(50);
        assert!(notification_due(started, OffsetDateTime::UNIX_EPOCH, now));
    }

    #[test]
    fn cooled_down_record_is_due_again() {
        let now = now_utc();
        let started = now - Duration::days(50);
        assert!(notification_due(started, started, now));
    }

    #[test]
    fn record_notified_now_is_not_due() {
        let now = now_utc();
        let started = now - Duration::days(50);
        assert!(!notification_due(started, now, now));
    }

    #[test]
    fn final_notice_suppresses_selection_at_window_boundary() {
        let now = now_utc();
        let started = now - Duration::days(90);
        let final_notice = started + NOTICE_WINDOW;
        assert!(!notification_due(started, final_notice, now));

        let before_final = started + NOTICE_WINDOW - Duration::seconds(1);
        assert!(notification_due(started, before_final, now));
    }

    #[test]
    fn cooldown_suppresses_even_before_final_notice() {
        let now = now_utc();
        let started = now - Duration::days(20);
        let recent = now - Duration::hours(6);
        assert!(!notification_due(started, recent, now));
    }
}
