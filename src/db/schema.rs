//! Ledger schema bootstrap
//!
//! Migration tooling is not part of this crate; `INIT_SQL` is idempotent and
//! only creates what is missing.

pub const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username            VARCHAR PRIMARY KEY,
    hashed_password     VARCHAR NOT NULL,
    full_name           VARCHAR NOT NULL,
    email               VARCHAR NOT NULL,
    password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '0001-01-01 00:00:00Z',
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    is_email_verified   BOOLEAN NOT NULL DEFAULT FALSE,
    CONSTRAINT users_email_key UNIQUE (email)
);

CREATE TABLE IF NOT EXISTS accounts (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR NOT NULL,
    balance    BIGINT NOT NULL,
    currency   VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT accounts_owner_fkey FOREIGN KEY (owner) REFERENCES users (username),
    CONSTRAINT owner_currency_key UNIQUE (owner, currency)
);

CREATE TABLE IF NOT EXISTS entries (
    id         BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL,
    amount     BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT entries_account_id_fkey FOREIGN KEY (account_id) REFERENCES accounts (id)
);

CREATE TABLE IF NOT EXISTS transfers (
    id              BIGSERIAL PRIMARY KEY,
    from_account_id BIGINT NOT NULL,
    to_account_id   BIGINT NOT NULL,
    amount          BIGINT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT transfers_from_account_id_fkey FOREIGN KEY (from_account_id) REFERENCES accounts (id),
    CONSTRAINT transfers_to_account_id_fkey FOREIGN KEY (to_account_id) REFERENCES accounts (id),
    CONSTRAINT transfers_amount_positive CHECK (amount > 0)
);

CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner);
CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id);
CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id);
CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id);
CREATE INDEX IF NOT EXISTS transfers_from_to_idx ON transfers (from_account_id, to_account_id);
"#;
