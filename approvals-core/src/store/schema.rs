//! Relational schema for the SQLite store.

/// Idempotent DDL applied on every open.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS invoices (
    id              TEXT PRIMARY KEY,
    entity_id       TEXT NOT NULL,
    vendor_id       TEXT NOT NULL,
    invoice_number  TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'draft'
        CHECK (status IN ('draft', 'pending_approval', 'approved', 'posted', 'paid', 'void')),
    subtotal        INTEGER NOT NULL DEFAULT 0,
    tax_amount      INTEGER NOT NULL DEFAULT 0,
    total_amount    INTEGER GENERATED ALWAYS AS (subtotal + tax_amount) STORED,
    amount_paid     INTEGER NOT NULL DEFAULT 0,
    amount_due      INTEGER GENERATED ALWAYS AS (subtotal + tax_amount - amount_paid) STORED,
    approved_by     TEXT,
    approved_at     TEXT,
    approval_notes  TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE (entity_id, vendor_id, invoice_number)
);

CREATE TABLE IF NOT EXISTS invoice_lines (
    invoice_id   TEXT NOT NULL REFERENCES invoices(id) ON DELETE CASCADE,
    line_number  INTEGER NOT NULL CHECK (line_number >= 1),
    account_id   TEXT NOT NULL,
    description  TEXT NOT NULL,
    amount       INTEGER NOT NULL,
    tax_amount   INTEGER NOT NULL DEFAULT 0,
    department   TEXT,
    PRIMARY KEY (invoice_id, line_number)
);

CREATE TABLE IF NOT EXISTS approval_rules (
    id          TEXT PRIMARY KEY,
    entity_id   TEXT NOT NULL,
    name        TEXT NOT NULL,
    rule_type   TEXT NOT NULL
        CHECK (rule_type IN ('amount_based', 'vendor_based', 'department_based')),
    is_active   INTEGER NOT NULL DEFAULT 1,
    min_amount  INTEGER CHECK (min_amount IS NULL OR min_amount >= 0),
    max_amount  INTEGER CHECK (max_amount IS NULL OR max_amount >= 0),
    vendor_id   TEXT,
    department  TEXT,
    steps       TEXT NOT NULL,
    priority    INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE (entity_id, name),
    CHECK (min_amount IS NULL OR max_amount IS NULL OR min_amount <= max_amount)
);

CREATE INDEX IF NOT EXISTS idx_approval_rules_eval
    ON approval_rules (entity_id, is_active, priority);

CREATE TABLE IF NOT EXISTS approval_workflows (
    id                TEXT PRIMARY KEY,
    invoice_id        TEXT NOT NULL REFERENCES invoices(id),
    entity_id         TEXT NOT NULL,
    rule_id           TEXT REFERENCES approval_rules(id),
    status            TEXT NOT NULL
        CHECK (status IN ('pending', 'in_progress', 'approved', 'rejected', 'recalled')),
    total_steps       INTEGER NOT NULL CHECK (total_steps >= 1),
    current_step      INTEGER NOT NULL CHECK (current_step >= 1),
    submitted_by      TEXT NOT NULL,
    submitted_at      TEXT NOT NULL,
    completed_at      TEXT,
    submission_notes  TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_approval_workflows_one_active
    ON approval_workflows (invoice_id)
    WHERE status IN ('pending', 'in_progress');

CREATE TABLE IF NOT EXISTS approval_steps (
    id                TEXT PRIMARY KEY,
    workflow_id       TEXT NOT NULL REFERENCES approval_workflows(id) ON DELETE CASCADE,
    invoice_id        TEXT NOT NULL REFERENCES invoices(id),
    entity_id         TEXT NOT NULL,
    step_number       INTEGER NOT NULL CHECK (step_number >= 1),
    required_role     TEXT NOT NULL,
    is_required       INTEGER NOT NULL DEFAULT 1,
    assigned_to       TEXT,
    assigned_at       TEXT,
    delegated_to      TEXT,
    delegated_at      TEXT,
    delegated_reason  TEXT,
    status            TEXT NOT NULL
        CHECK (status IN ('pending', 'approved', 'rejected', 'delegated', 'recalled', 'skipped')),
    acted_by          TEXT,
    acted_at          TEXT,
    action_notes      TEXT,
    due_at            TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    UNIQUE (workflow_id, step_number)
);

CREATE INDEX IF NOT EXISTS idx_approval_steps_holder
    ON approval_steps (entity_id, status, delegated_to, assigned_to);

CREATE TABLE IF NOT EXISTS approval_audit_log (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT NOT NULL UNIQUE,
    invoice_id     TEXT NOT NULL,
    workflow_id    TEXT REFERENCES approval_workflows(id),
    step_id        TEXT REFERENCES approval_steps(id),
    entity_id      TEXT NOT NULL,
    action         TEXT NOT NULL
        CHECK (action IN ('submitted', 'approved', 'rejected', 'recalled', 'delegated', 'reassigned')),
    performed_by   TEXT NOT NULL,
    performed_at   TEXT NOT NULL,
    status_before  TEXT,
    status_after   TEXT,
    metadata       TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_approval_audit_invoice
    ON approval_audit_log (invoice_id, performed_at, seq);

CREATE TRIGGER IF NOT EXISTS approval_audit_log_no_update
    BEFORE UPDATE ON approval_audit_log
BEGIN
    SELECT RAISE(ABORT, 'approval_audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS approval_audit_log_no_delete
    BEFORE DELETE ON approval_audit_log
BEGIN
    SELECT RAISE(ABORT, 'approval_audit_log is append-only');
END;
"#;
