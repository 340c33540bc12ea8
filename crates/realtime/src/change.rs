//! Pushed row changes and their wire format.
//!
//! The backend sends JSON text frames shaped like
//! `{"entity_kind": "...", "operation": "...", "owner_user_id": "...",
//! "payload": {...}, "server_timestamp": "..."}`. This module decodes
//! them into the closed [`ChangeEvent`] union so consumers handle every
//! entity kind exhaustively.

use std::fmt;

use loyalty_core::models::{CheckIn, Coupon, SpinBalance};
use loyalty_core::store::{ApplyOutcome, StateStore};
use loyalty_core::types::{Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelError;

/// The three change streams a subscription carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    SpinBalance,
    CheckIn,
    Coupon,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::SpinBalance,
        EntityKind::CheckIn,
        EntityKind::Coupon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::SpinBalance => "spin_balance",
            EntityKind::CheckIn => "check_in",
            EntityKind::Coupon => "coupon",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row change for entity type `T`.
///
/// For deletes, `record` carries the row as it was before removal.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub operation: Operation,
    pub owner_user_id: UserId,
    pub record: T,
    pub server_timestamp: Timestamp,
}

impl<T> Change<T> {
    /// The row as it should be cached after this change, `None` for deletes.
    pub fn live_record(&self) -> Option<&T> {
        match self.operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => Some(&self.record),
        }
    }
}

/// A change pushed on one of the three streams.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    SpinBalance(Change<SpinBalance>),
    CheckIn(Change<CheckIn>),
    Coupon(Change<Coupon>),
}

impl ChangeEvent {
    pub fn kind(&self) -> EntityKind {
        match self {
            ChangeEvent::SpinBalance(_) => EntityKind::SpinBalance,
            ChangeEvent::CheckIn(_) => EntityKind::CheckIn,
            ChangeEvent::Coupon(_) => EntityKind::Coupon,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            ChangeEvent::SpinBalance(c) => c.operation,
            ChangeEvent::CheckIn(c) => c.operation,
            ChangeEvent::Coupon(c) => c.operation,
        }
    }

    pub fn owner_user_id(&self) -> UserId {
        match self {
            ChangeEvent::SpinBalance(c) => c.owner_user_id,
            ChangeEvent::CheckIn(c) => c.owner_user_id,
            ChangeEvent::Coupon(c) => c.owner_user_id,
        }
    }

    pub fn server_timestamp(&self) -> Timestamp {
        match self {
            ChangeEvent::SpinBalance(c) => c.server_timestamp,
            ChangeEvent::CheckIn(c) => c.server_timestamp,
            ChangeEvent::Coupon(c) => c.server_timestamp,
        }
    }

    /// Offer this change to the store's cache (last-write-wins by
    /// server timestamp).
    pub fn apply_to(&self, store: &StateStore) -> ApplyOutcome {
        match self {
            ChangeEvent::SpinBalance(c) => store.apply_spin_balance(
                c.record.user_id,
                c.live_record().cloned(),
                c.server_timestamp,
            ),
            ChangeEvent::CheckIn(c) => {
                store.apply_check_in(c.record.id, c.live_record().cloned(), c.server_timestamp)
            }
            ChangeEvent::Coupon(c) => {
                store.apply_coupon(c.record.id, c.live_record().cloned(), c.server_timestamp)
            }
        }
    }
}

/// Raw frame as it appears on the wire, before the payload is typed.
#[derive(Debug, Serialize, Deserialize)]
struct WireChange {
    entity_kind: EntityKind,
    operation: Operation,
    owner_user_id: UserId,
    payload: serde_json::Value,
    server_timestamp: Timestamp,
}

/// Decode a text frame into a [`ChangeEvent`].
///
/// Unknown entity kinds and payloads that do not match the kind's row
/// shape are reported as [`ChannelError::Decode`].
pub fn decode_frame(text: &str) -> Result<ChangeEvent, ChannelError> {
    let wire: WireChange =
        serde_json::from_str(text).map_err(|e| ChannelError::Decode(e.to_string()))?;

    let event = match wire.entity_kind {
        EntityKind::SpinBalance => ChangeEvent::SpinBalance(typed(wire)?),
        EntityKind::CheckIn => ChangeEvent::CheckIn(typed(wire)?),
        EntityKind::Coupon => ChangeEvent::Coupon(typed(wire)?),
    };
    Ok(event)
}

/// Encode a [`ChangeEvent`] as a wire frame.
pub fn encode_frame(event: &ChangeEvent) -> Result<String, ChannelError> {
    let payload = match event {
        ChangeEvent::SpinBalance(c) => serde_json::to_value(&c.record),
        ChangeEvent::CheckIn(c) => serde_json::to_value(&c.record),
        ChangeEvent::Coupon(c) => serde_json::to_value(&c.record),
    }
    .map_err(|e| ChannelError::Decode(e.to_string()))?;

    let wire = WireChange {
        entity_kind: event.kind(),
        operation: event.operation(),
        owner_user_id: event.owner_user_id(),
        payload,
        server_timestamp: event.server_timestamp(),
    };
    serde_json::to_string(&wire).map_err(|e| ChannelError::Decode(e.to_string()))
}

fn typed<T>(wire: WireChange) -> Result<Change<T>, ChannelError>
where
    T: for<'de> Deserialize<'de>,
{
    let record = serde_json::from_value(wire.payload).map_err(|e| {
        ChannelError::Decode(format!("bad {} payload: {e}", wire.entity_kind))
    })?;
    Ok(Change {
        operation: wire.operation,
        owner_user_id: wire.owner_user_id,
        record,
        server_timestamp: wire.server_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use loyalty_core::models::CouponStatus;

    const USER: &str = "6f1c2a9e-1b7d-4c61-9a43-0d9e6c1f2b10";
    const COUPON: &str = "0b4f7a1c-8e1d-4a8a-b5a8-3f2a9c7d6e54";

    #[test]
    fn decode_coupon_insert() {
        let json = format!(
            r#"{{"entity_kind":"coupon","operation":"insert","owner_user_id":"{USER}",
                "payload":{{"id":"{COUPON}","user_id":"{USER}","code":"WHEEL-7",
                "prize":"free dessert","status":"active","expires_at":null}},
                "server_timestamp":"2024-05-01T10:00:00Z"}}"#
        );

        let event = decode_frame(&json).unwrap();

        assert_eq!(event.kind(), EntityKind::Coupon);
        assert_matches!(event, ChangeEvent::Coupon(ref c) if c.record.code == "WHEEL-7"
            && c.record.status == CouponStatus::Active
            && c.operation == Operation::Insert);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let json = format!(
            r#"{{"entity_kind":"voucher","operation":"insert","owner_user_id":"{USER}",
                "payload":{{}},"server_timestamp":"2024-05-01T10:00:00Z"}}"#
        );

        assert_matches!(decode_frame(&json), Err(ChannelError::Decode(_)));
    }

    #[test]
    fn decode_rejects_payload_of_wrong_shape() {
        let json = format!(
            r#"{{"entity_kind":"spin_balance","operation":"update","owner_user_id":"{USER}",
                "payload":{{"spins":"three"}},"server_timestamp":"2024-05-01T10:00:00Z"}}"#
        );

        let err = decode_frame(&json).unwrap_err();
        assert!(err.to_string().contains("spin_balance"), "got: {err}");
    }

    #[test]
    fn delete_has_no_live_record() {
        let change = Change {
            operation: Operation::Delete,
            owner_user_id: uuid::Uuid::nil(),
            record: 5,
            server_timestamp: Timestamp::UNIX_EPOCH,
        };
        assert!(change.live_record().is_none());
    }

    #[test]
    fn encoded_frame_carries_the_kind_tag() {
        let user = uuid::Uuid::new_v4();
        let event = ChangeEvent::SpinBalance(Change {
            operation: Operation::Update,
            owner_user_id: user,
            record: SpinBalance {
                user_id: user,
                spins_available: 4,
                updated_at: Timestamp::UNIX_EPOCH,
            },
            server_timestamp: Timestamp::UNIX_EPOCH,
        });

        let frame = encode_frame(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["entity_kind"], "spin_balance");
        assert_eq!(value["payload"]["spins_available"], 4);
    }
}
