//! SQL schema for the sightline SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per (ip, partition, source). status_rank only ever increases:
-- active 0, expired 1, promoted 2.
CREATE TABLE IF NOT EXISTS network_sightings (
    sighting_id    TEXT PRIMARY KEY,
    partition      TEXT NOT NULL,
    ip             TEXT NOT NULL,
    subnet_id      TEXT,
    source         TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'active',
    status_rank    INTEGER NOT NULL DEFAULT 0,
    first_seen     TEXT NOT NULL,
    last_seen      TEXT NOT NULL,
    ttl_expires_at TEXT,
    fingerprint_id TEXT,
    metadata       TEXT NOT NULL DEFAULT '{}',
    UNIQUE (ip, partition, source)
);

-- Append-only.
CREATE TABLE IF NOT EXISTS sighting_events (
    event_id    TEXT PRIMARY KEY,
    sighting_id TEXT NOT NULL,
    device_id   TEXT,
    event_type  TEXT NOT NULL,
    actor       TEXT NOT NULL DEFAULT 'system',
    details     TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subnet_policies (
    subnet_id       TEXT PRIMARY KEY,
    cidr            TEXT NOT NULL,
    classification  TEXT NOT NULL DEFAULT '',
    promotion_rules TEXT NOT NULL DEFAULT '{}',
    reaper_profile  TEXT NOT NULL DEFAULT 'default',
    allow_ip_as_id  INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device_identifiers (
    id_type    TEXT NOT NULL,
    id_value   TEXT NOT NULL,
    device_id  TEXT NOT NULL,
    confidence TEXT NOT NULL DEFAULT 'weak',
    source     TEXT NOT NULL DEFAULT '',
    first_seen TEXT NOT NULL,
    last_seen  TEXT NOT NULL,
    verified   INTEGER NOT NULL DEFAULT 0,
    metadata   TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (id_type, id_value)
);

CREATE TABLE IF NOT EXISTS devices (
    device_id         TEXT PRIMARY KEY,
    ip                TEXT NOT NULL,
    poller_id         TEXT,
    agent_id          TEXT,
    hostname          TEXT,
    mac               TEXT,
    discovery_sources TEXT NOT NULL DEFAULT '[]',
    is_available      INTEGER NOT NULL DEFAULT 0,
    first_seen        TEXT NOT NULL,
    last_seen         TEXT NOT NULL,
    metadata          TEXT NOT NULL DEFAULT '{}',
    merged_into       TEXT,
    device_type       TEXT NOT NULL DEFAULT 'unknown',
    service_type      TEXT,
    service_status    TEXT,
    last_heartbeat    TEXT,
    os_info           TEXT,
    version_info      TEXT,
    CHECK (merged_into IS NULL OR merged_into != device_id)
);

-- Lookup index over the alias maps kept in device metadata.
CREATE TABLE IF NOT EXISTS device_aliases (
    alias_kind  TEXT NOT NULL,   -- 'service' | 'ip'
    alias_value TEXT NOT NULL,
    device_id   TEXT NOT NULL,
    last_seen   TEXT NOT NULL,
    PRIMARY KEY (alias_kind, alias_value, device_id)
);

-- Append-only.
CREATE TABLE IF NOT EXISTS merge_audit (
    event_id         TEXT PRIMARY KEY,
    from_device_id   TEXT NOT NULL,
    to_device_id     TEXT NOT NULL,
    reason           TEXT NOT NULL,
    confidence_score REAL,
    source           TEXT NOT NULL DEFAULT '',
    details          TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL
);

-- Append-only.
CREATE TABLE IF NOT EXISTS capability_events (
    event_id       TEXT PRIMARY KEY,
    device_id      TEXT NOT NULL,
    capability     TEXT NOT NULL,
    service_id     TEXT NOT NULL DEFAULT '',
    service_type   TEXT NOT NULL DEFAULT '',
    state          TEXT NOT NULL,
    success        INTEGER NOT NULL,
    failure_reason TEXT,
    recorded_by    TEXT NOT NULL DEFAULT '',
    checked_at     TEXT NOT NULL,
    metadata       TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS device_capabilities (
    device_id      TEXT NOT NULL,
    capability     TEXT NOT NULL,
    service_id     TEXT NOT NULL DEFAULT '',
    service_type   TEXT NOT NULL DEFAULT '',
    state          TEXT NOT NULL,
    enabled        INTEGER NOT NULL,
    failure_reason TEXT,
    recorded_by    TEXT NOT NULL DEFAULT '',
    last_checked   TEXT NOT NULL,
    last_success   TEXT,
    last_failure   TEXT,
    metadata       TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (device_id, capability, service_id)
);

CREATE INDEX IF NOT EXISTS sightings_status_idx     ON network_sightings(status, first_seen);
CREATE INDEX IF NOT EXISTS sightings_last_seen_idx  ON network_sightings(last_seen);
CREATE INDEX IF NOT EXISTS sighting_events_sid_idx  ON sighting_events(sighting_id, created_at);
CREATE INDEX IF NOT EXISTS identifiers_device_idx   ON device_identifiers(device_id);
CREATE INDEX IF NOT EXISTS devices_ip_idx           ON devices(ip);
CREATE INDEX IF NOT EXISTS devices_last_seen_idx    ON devices(last_seen);
CREATE INDEX IF NOT EXISTS devices_merged_into_idx  ON devices(merged_into);
CREATE INDEX IF NOT EXISTS aliases_device_idx       ON device_aliases(device_id);
CREATE INDEX IF NOT EXISTS merge_audit_from_idx     ON merge_audit(from_device_id);
CREATE INDEX IF NOT EXISTS merge_audit_to_idx       ON merge_audit(to_device_id);
CREATE INDEX IF NOT EXISTS merge_audit_created_idx  ON merge_audit(created_at);
CREATE INDEX IF NOT EXISTS capability_events_dev_idx ON capability_events(device_id, checked_at);

PRAGMA user_version = 1;
";
