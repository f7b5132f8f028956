//! Account row model — persists [`crate::domain::Account`] with its `session_material`
//! envelope-encrypted at rest (ciphertext + nonce stored as separate columns so the
//! repository never has to parse a combined blob).

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: String,
    pub owner_principal_id: String,
    pub display_label: String,
    pub session_material_ciphertext: Vec<u8>,
    pub session_material_nonce: Vec<u8>,
    pub state: String,
    pub last_validated_at_ms: i64,
}
