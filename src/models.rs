use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ===== Ingested Records =====

/// Postal address owned by a [`User`].
///
/// `user_id` is accepted from the input document but never trusted; see
/// [`User::claim_addresses`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(default)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
    pub user_id: String,
}

/// A user record as it appears in the input array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone_number: String,
    pub addresses: Vec<Address>,
}

impl User {
    /// Point every address at this user, discarding whatever `user_id` the
    /// input carried.
    pub fn claim_addresses(&mut self) {
        for address in &mut self.addresses {
            if address.user_id != self.id {
                address.user_id.clone_from(&self.id);
            }
        }
    }
}
