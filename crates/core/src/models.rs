//! Entity rows mirrored from the backend and cached on the client.
//!
//! Field names follow the backend column names so the push payloads
//! deserialize directly.

use serde::{Deserialize, Serialize};

use crate::types::{RecordId, Timestamp, UserId};

/// Remaining prize-wheel spins for one user. There is one row per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinBalance {
    pub user_id: UserId,
    pub spins_available: i32,
    pub updated_at: Timestamp,
}

/// A visit recorded at a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: RecordId,
    pub user_id: UserId,
    pub branch_id: RecordId,
    pub status: CheckInStatus,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// A coupon won on the wheel or granted by a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: RecordId,
    pub user_id: UserId,
    pub code: String,
    pub prize: String,
    pub status: CouponStatus,
    pub expires_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Active,
    Redeemed,
    Expired,
}

impl Coupon {
    /// Whether the coupon can still be presented at a counter at `now`.
    pub fn is_redeemable(&self, now: Timestamp) -> bool {
        self.status == CouponStatus::Active && self.expires_at.map_or(true, |at| now < at)
    }
}
