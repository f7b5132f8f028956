//! `Account` persistence. Implements [`crate::session::AccountStore`] for the
//! Session Lifecycle Manager; also exposes the CRUD surface the Service Facade
//! needs for account registration that the narrower trait does not.

use async_trait::async_trait;

use crate::database::DbPool;
use crate::database::models::AccountRow;
use crate::database::repositories::crypto::{decrypt_session_material, encrypt_session_material};
use crate::database::time::{datetime_to_ms, ms_to_datetime, now_ms};
use crate::domain::{Account, AccountState, SessionMaterial};
use crate::error::{Error, Result};
use crate::session::AccountStore;

pub struct SqlxAccountRepository {
    pool: DbPool,
    encryption_key: Vec<u8>,
}

impl SqlxAccountRepository {
    pub fn new(pool: DbPool, encryption_key: Vec<u8>) -> Self {
        Self { pool, encryption_key }
    }

    fn row_to_account(&self, row: AccountRow) -> Result<Account> {
        let plaintext = decrypt_session_material(
            &self.encryption_key,
            &row.id,
            &row.session_material_ciphertext,
            &row.session_material_nonce,
        )?;
        Ok(Account {
            id: row.id,
            owner_principal_id: row.owner_principal_id,
            display_label: row.display_label,
            session_material: SessionMaterial::new(plaintext),
            state: parse_state(&row.state)?,
            last_validated_at: ms_to_datetime(row.last_validated_at_ms),
        })
    }

    /// Inserts a brand-new account (spec §4.4's "Link" operation). The facade calls
    /// this directly; `session::AccountStore` has no insert method because the
    /// recovery task never needs one.
    pub async fn create(&self, account: &Account) -> Result<()> {
        let (ciphertext, nonce) = encrypt_session_material(
            &self.encryption_key,
            &account.id,
            account.session_material.reveal_for_transport(),
        )?;
        sqlx::query(
            "INSERT INTO accounts (id, owner_principal_id, display_label, session_material_ciphertext, session_material_nonce, state, last_validated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.owner_principal_id)
        .bind(&account.display_label)
        .bind(ciphertext)
        .bind(nonce)
        .bind(state_label(account.state))
        .bind(datetime_to_ms(account.last_validated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as("SELECT * FROM accounts ORDER BY id").fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| self.row_to_account(row)).collect()
    }

    /// Replaces `session_material` after an operator rotates credentials out-of-band
    /// (spec §9's degraded-account open question resolution path); resets
    /// `last_validated_at` to now and leaves `state` untouched — the caller is
    /// expected to also call `SessionManager::invalidate_cache`.
    pub async fn replace_session_material(&self, account_id: &str, material: &SessionMaterial) -> Result<()> {
        let (ciphertext, nonce) = encrypt_session_material(&self.encryption_key, account_id, material.reveal_for_transport())?;
        let result = sqlx::query(
            "UPDATE accounts SET session_material_ciphertext = ?, session_material_nonce = ?, last_validated_at_ms = ? WHERE id = ?",
        )
        .bind(ciphertext)
        .bind(nonce)
        .bind(now_ms())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Account", account_id));
        }
        Ok(())
    }
}

fn state_label(state: AccountState) -> &'static str {
    match state {
        AccountState::Active => "active",
        AccountState::Degraded => "degraded",
        AccountState::Revoked => "revoked",
    }
}

fn parse_state(raw: &str) -> Result<AccountState> {
    match raw {
        "active" => Ok(AccountState::Active),
        "degraded" => Ok(AccountState::Degraded),
        "revoked" => Ok(AccountState::Revoked),
        other => Err(Error::internal(format!("unknown account state in storage: {other}"))),
    }
}

#[async_trait]
impl AccountStore for SqlxAccountRepository {
    async fn load(&self, account_id: &str) -> Result<Account> {
        let row: Option<AccountRow> = sqlx::query_as("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| Error::not_found("Account", account_id))?;
        self.row_to_account(row)
    }

    async fn save_state(&self, account_id: &str, state: AccountState) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET state = ?, last_validated_at_ms = ? WHERE id = ?")
            .bind(state_label(state))
            .bind(now_ms())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Account", account_id));
        }
        Ok(())
    }
}
