//! SQLite-backed store.
//!
//! A single connection sits behind `Arc<Mutex<_>>`; every call runs on the
//! blocking pool via `tokio::task::spawn_blocking`. Timestamps are stored as
//! RFC 3339 text with microsecond precision so they sort lexicographically.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use super::schema::SCHEMA;
use super::{AuditStore, RuleStore, WorkflowStore};
use crate::audit::AuditEntry;
use crate::error::{ApprovalError, Result, StoreError};
use crate::invoice::{Invoice, InvoiceLine, InvoiceStatus, InvoiceStore, NewInvoice};
use crate::rules::{ApprovalRule, MatchCriteria, first_match};
use crate::workflow::types::{
    ApprovalStep, ApprovalWorkflow, StepGuard, StepOutcome, StepStatus, WorkflowStatus,
    WorkflowTransition,
};

const RULE_COLUMNS: &str = "id, entity_id, name, rule_type, is_active, min_amount, max_amount, \
     vendor_id, department, steps, priority, created_at, updated_at";

const WORKFLOW_COLUMNS: &str = "id, invoice_id, entity_id, rule_id, status, total_steps, \
     current_step, submitted_by, submitted_at, completed_at, submission_notes, created_at, updated_at";

const STEP_COLUMNS: &str = "id, workflow_id, invoice_id, entity_id, step_number, required_role, \
     is_required, assigned_to, assigned_at, delegated_to, delegated_at, delegated_reason, status, \
     acted_by, acted_at, action_notes, due_at, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, invoice_id, workflow_id, step_id, entity_id, action, performed_by, \
     performed_at, status_before, status_after, metadata";

const INVOICE_COLUMNS: &str = "id, entity_id, vendor_id, invoice_number, status, subtotal, \
     tax_amount, total_amount, amount_paid, amount_due, approved_by, approved_at, approval_notes";

/// Restricts a step update to the current, actionable step of an in-progress workflow.
const CURRENT_STEP_GUARD: &str = "status IN ('pending', 'delegated') AND EXISTS (\
     SELECT 1 FROM approval_workflows w WHERE w.id = approval_steps.workflow_id \
     AND w.status = 'in_progress' AND w.current_step = approval_steps.step_number)";

/// Matches a step's status and holders against a [`StepGuard`] bound at
/// parameters `?first`, `?first+1`, `?first+2`.
fn holder_guard(first: usize) -> String {
    format!(
        "status = ?{} AND assigned_to IS ?{} AND delegated_to IS ?{}",
        first,
        first + 1,
        first + 2
    )
}

fn stale_step(step_number: u32, action: &str) -> ApprovalError {
    ApprovalError::conflict(format!(
        "approval step {step_number} cannot be {action}: it is no longer actionable or changed since it was read"
    ))
}

/// Relational store implementing every persistence interface plus the
/// invoice collaborator.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::from)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        tracing::debug!(path = %path.display(), "Opened approvals database");
        Self::init(conn)
    }

    /// Private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await
        .map_err(StoreError::from)?
    }

    /// Insert a draft invoice with its lines. Subtotal and tax are summed
    /// from the lines; total and amount due are computed by the database.
    pub async fn create_invoice(&self, new: NewInvoice) -> Result<Invoice> {
        for (field, value) in [
            ("entity_id", &new.entity_id),
            ("vendor_id", &new.vendor_id),
            ("invoice_number", &new.invoice_number),
        ] {
            if value.trim().is_empty() {
                return Err(ApprovalError::invalid_input(field, "must not be empty"));
            }
        }
        let mut subtotal: i64 = 0;
        let mut tax: i64 = 0;
        for line in &new.lines {
            if line.line_number == 0 {
                return Err(ApprovalError::invalid_input("lines", "line numbers start at 1"));
            }
            subtotal = subtotal
                .checked_add(line.amount)
                .ok_or_else(|| ApprovalError::invalid_input("lines", "subtotal overflows"))?;
            tax = tax
                .checked_add(line.tax_amount)
                .ok_or_else(|| ApprovalError::invalid_input("lines", "tax overflows"))?;
        }
        if subtotal.checked_add(tax).is_none() {
            return Err(ApprovalError::invalid_input("lines", "total overflows"));
        }

        self.call(move |conn| {
            let id = Uuid::new_v4();
            let now = ts(&Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO invoices (id, entity_id, vendor_id, invoice_number, status, subtotal, \
                 tax_amount, amount_paid, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, 0, ?7, ?7)",
                params![
                    id.to_string(),
                    new.entity_id,
                    new.vendor_id,
                    new.invoice_number,
                    subtotal,
                    tax,
                    now
                ],
            )?;
            for line in &new.lines {
                tx.execute(
                    "INSERT INTO invoice_lines (invoice_id, line_number, account_id, description, \
                     amount, tax_amount, department) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id.to_string(),
                        line.line_number,
                        line.account_id,
                        line.description,
                        line.amount,
                        line.tax_amount,
                        line.department
                    ],
                )?;
            }
            let invoice = fetch_invoice(&tx, id, &new.entity_id)?;
            tx.commit()?;
            tracing::info!(invoice_id = %id, invoice_number = %invoice.invoice_number, "Invoice created");
            Ok(invoice)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_opt(dt: Option<&DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Read a text column and parse it.
fn parsed<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let idx = row.as_ref().column_index(col)?;
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parsed_opt<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let idx = row.as_ref().column_index(col)?;
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| r.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<T> {
    let idx = row.as_ref().column_index(col)?;
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

/// `a, b` -> `s.a, s.b`
fn qualified(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRule> {
    Ok(ApprovalRule {
        id: parsed(row, "id")?,
        entity_id: row.get("entity_id")?,
        name: row.get("name")?,
        rule_type: parsed(row, "rule_type")?,
        is_active: row.get("is_active")?,
        min_amount: row.get("min_amount")?,
        max_amount: row.get("max_amount")?,
        vendor_id: row.get("vendor_id")?,
        department: row.get("department")?,
        steps: json_col(row, "steps")?,
        priority: row.get("priority")?,
        created_at: parsed(row, "created_at")?,
        updated_at: parsed(row, "updated_at")?,
    })
}

fn workflow_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalWorkflow> {
    Ok(ApprovalWorkflow {
        id: parsed(row, "id")?,
        invoice_id: parsed(row, "invoice_id")?,
        entity_id: row.get("entity_id")?,
        rule_id: parsed_opt(row, "rule_id")?,
        status: parsed(row, "status")?,
        total_steps: row.get("total_steps")?,
        current_step: row.get("current_step")?,
        submitted_by: row.get("submitted_by")?,
        submitted_at: parsed(row, "submitted_at")?,
        completed_at: parsed_opt(row, "completed_at")?,
        submission_notes: row.get("submission_notes")?,
        created_at: parsed(row, "created_at")?,
        updated_at: parsed(row, "updated_at")?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalStep> {
    Ok(ApprovalStep {
        id: parsed(row, "id")?,
        workflow_id: parsed(row, "workflow_id")?,
        invoice_id: parsed(row, "invoice_id")?,
        entity_id: row.get("entity_id")?,
        step_number: row.get("step_number")?,
        required_role: row.get("required_role")?,
        is_required: row.get("is_required")?,
        assigned_to: row.get("assigned_to")?,
        assigned_at: parsed_opt(row, "assigned_at")?,
        delegated_to: row.get("delegated_to")?,
        delegated_at: parsed_opt(row, "delegated_at")?,
        delegated_reason: row.get("delegated_reason")?,
        status: parsed(row, "status")?,
        acted_by: row.get("acted_by")?,
        acted_at: parsed_opt(row, "acted_at")?,
        action_notes: row.get("action_notes")?,
        due_at: parsed_opt(row, "due_at")?,
        created_at: parsed(row, "created_at")?,
        updated_at: parsed(row, "updated_at")?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: parsed(row, "id")?,
        invoice_id: parsed(row, "invoice_id")?,
        workflow_id: parsed_opt(row, "workflow_id")?,
        step_id: parsed_opt(row, "step_id")?,
        entity_id: row.get("entity_id")?,
        action: parsed(row, "action")?,
        performed_by: row.get("performed_by")?,
        performed_at: parsed(row, "performed_at")?,
        status_before: parsed_opt(row, "status_before")?,
        status_after: parsed_opt(row, "status_after")?,
        metadata: json_col(row, "metadata")?,
    })
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: parsed(row, "id")?,
        entity_id: row.get("entity_id")?,
        vendor_id: row.get("vendor_id")?,
        invoice_number: row.get("invoice_number")?,
        status: parsed(row, "status")?,
        subtotal: row.get("subtotal")?,
        tax_amount: row.get("tax_amount")?,
        total_amount: row.get("total_amount")?,
        amount_paid: row.get("amount_paid")?,
        amount_due: row.get("amount_due")?,
        approved_by: row.get("approved_by")?,
        approved_at: parsed_opt(row, "approved_at")?,
        approval_notes: row.get("approval_notes")?,
        lines: Vec::new(),
    })
}

fn line_from_row(row: &Row<'_>) -> rusqlite::Result<InvoiceLine> {
    Ok(InvoiceLine {
        line_number: row.get("line_number")?,
        account_id: row.get("account_id")?,
        description: row.get("description")?,
        amount: row.get("amount")?,
        tax_amount: row.get("tax_amount")?,
        department: row.get("department")?,
    })
}

// ---------------------------------------------------------------------------
// Fetch helpers (shared by reads and read-after-write)
// ---------------------------------------------------------------------------

fn fetch_rule(conn: &Connection, id: Uuid, entity_id: &str) -> Result<ApprovalRule> {
    conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM approval_rules WHERE id = ?1 AND entity_id = ?2"),
        params![id.to_string(), entity_id],
        rule_from_row,
    )
    .optional()?
    .ok_or_else(|| ApprovalError::not_found("approval_rule", id.to_string()))
}

fn fetch_workflow(conn: &Connection, id: Uuid, entity_id: &str) -> Result<ApprovalWorkflow> {
    conn.query_row(
        &format!("SELECT {WORKFLOW_COLUMNS} FROM approval_workflows WHERE id = ?1 AND entity_id = ?2"),
        params![id.to_string(), entity_id],
        workflow_from_row,
    )
    .optional()?
    .ok_or_else(|| ApprovalError::not_found("approval_workflow", id.to_string()))
}

fn fetch_steps(conn: &Connection, workflow_id: Uuid) -> Result<Vec<ApprovalStep>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM approval_steps WHERE workflow_id = ?1 ORDER BY step_number"
    ))?;
    let steps = stmt
        .query_map(params![workflow_id.to_string()], step_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(steps)
}

fn fetch_step(conn: &Connection, workflow_id: Uuid, step_number: u32) -> Result<ApprovalStep> {
    conn.query_row(
        &format!(
            "SELECT {STEP_COLUMNS} FROM approval_steps WHERE workflow_id = ?1 AND step_number = ?2"
        ),
        params![workflow_id.to_string(), step_number],
        step_from_row,
    )
    .optional()?
    .ok_or_else(|| {
        ApprovalError::not_found("approval_step", format!("{workflow_id}#{step_number}"))
    })
}

fn fetch_invoice(conn: &Connection, id: Uuid, entity_id: &str) -> Result<Invoice> {
    let mut invoice = conn
        .query_row(
            &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1 AND entity_id = ?2"),
            params![id.to_string(), entity_id],
            invoice_from_row,
        )
        .optional()?
        .ok_or_else(|| ApprovalError::not_found("invoice", id.to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT line_number, account_id, description, amount, tax_amount, department \
         FROM invoice_lines WHERE invoice_id = ?1 ORDER BY line_number",
    )?;
    invoice.lines = stmt
        .query_map(params![id.to_string()], line_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(invoice)
}

fn query_steps(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ApprovalStep>> {
    let mut stmt = conn.prepare(sql)?;
    let steps = stmt
        .query_map(params, step_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(steps)
}

fn query_audit(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let entries = stmt
        .query_map(params, audit_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

// ---------------------------------------------------------------------------
// RuleStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RuleStore for SqliteStore {
    async fn create_rule(&self, rule: ApprovalRule) -> Result<ApprovalRule> {
        rule.validate()?;
        let steps = serde_json::to_string(&rule.ordered_steps())?;
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO approval_rules ({RULE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    rule.id.to_string(),
                    rule.entity_id,
                    rule.name,
                    rule.rule_type.to_string(),
                    rule.is_active,
                    rule.min_amount,
                    rule.max_amount,
                    rule.vendor_id,
                    rule.department,
                    steps,
                    rule.priority,
                    ts(&rule.created_at),
                    ts(&rule.updated_at)
                ],
            )?;
            tracing::info!(rule_id = %rule.id, entity_id = %rule.entity_id, name = %rule.name, "Approval rule created");
            fetch_rule(conn, rule.id, &rule.entity_id)
        })
        .await
    }

    async fn get_rule(&self, id: Uuid, entity_id: &str) -> Result<ApprovalRule> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| fetch_rule(conn, id, &entity_id)).await
    }

    async fn list_rules(&self, entity_id: &str, active_only: bool) -> Result<Vec<ApprovalRule>> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM approval_rules \
                 WHERE entity_id = ?1 AND (?2 = 0 OR is_active = 1) \
                 ORDER BY priority, name"
            ))?;
            let rules = stmt
                .query_map(params![entity_id, active_only], rule_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rules)
        })
        .await
    }

    async fn update_rule(&self, rule: ApprovalRule) -> Result<ApprovalRule> {
        rule.validate()?;
        let steps = serde_json::to_string(&rule.ordered_steps())?;
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE approval_rules SET name = ?1, rule_type = ?2, is_active = ?3, \
                 min_amount = ?4, max_amount = ?5, vendor_id = ?6, department = ?7, steps = ?8, \
                 priority = ?9, updated_at = ?10 WHERE id = ?11 AND entity_id = ?12",
                params![
                    rule.name,
                    rule.rule_type.to_string(),
                    rule.is_active,
                    rule.min_amount,
                    rule.max_amount,
                    rule.vendor_id,
                    rule.department,
                    steps,
                    rule.priority,
                    ts(&Utc::now()),
                    rule.id.to_string(),
                    rule.entity_id
                ],
            )?;
            if changed == 0 {
                return Err(ApprovalError::not_found("approval_rule", rule.id.to_string()));
            }
            tracing::info!(rule_id = %rule.id, "Approval rule updated");
            fetch_rule(conn, rule.id, &rule.entity_id)
        })
        .await
    }

    async fn delete_rule(&self, id: Uuid, entity_id: &str) -> Result<()> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "DELETE FROM approval_rules WHERE id = ?1 AND entity_id = ?2",
                params![id.to_string(), entity_id],
            )?;
            if changed == 0 {
                return Err(ApprovalError::not_found("approval_rule", id.to_string()));
            }
            tracing::info!(rule_id = %id, "Approval rule deleted");
            Ok(())
        })
        .await
    }

    async fn find_matching_rule(
        &self,
        entity_id: &str,
        amount: i64,
        vendor_id: Option<&str>,
        department: Option<&str>,
    ) -> Result<Option<ApprovalRule>> {
        let entity_id = entity_id.to_string();
        let vendor_id = vendor_id.map(String::from);
        let department = department.map(String::from);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM approval_rules \
                 WHERE entity_id = ?1 AND is_active = 1 \
                 ORDER BY priority, name"
            ))?;
            let rows = stmt.query_map(params![entity_id], rule_from_row)?;
            let criteria = MatchCriteria::new(amount, vendor_id.as_deref(), department.as_deref());
            let hit = first_match(rows, &criteria)?;
            tracing::debug!(
                entity_id = %entity_id,
                amount,
                rule_id = ?hit.as_ref().map(|r| r.id),
                "Rule evaluation finished"
            );
            Ok(hit)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn create_workflow(
        &self,
        workflow: ApprovalWorkflow,
        steps: Vec<ApprovalStep>,
    ) -> Result<(ApprovalWorkflow, Vec<ApprovalStep>)> {
        if steps.is_empty() {
            return Err(ApprovalError::invalid_input(
                "steps",
                "a workflow needs at least one step",
            ));
        }
        if usize::try_from(workflow.total_steps).ok() != Some(steps.len()) {
            return Err(ApprovalError::invalid_input(
                "total_steps",
                format!(
                    "total_steps is {} but {} steps were supplied",
                    workflow.total_steps,
                    steps.len()
                ),
            ));
        }

        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO approval_workflows ({WORKFLOW_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    workflow.id.to_string(),
                    workflow.invoice_id.to_string(),
                    workflow.entity_id,
                    workflow.rule_id.map(|id| id.to_string()),
                    workflow.status.as_str(),
                    workflow.total_steps,
                    workflow.current_step,
                    workflow.submitted_by,
                    ts(&workflow.submitted_at),
                    ts_opt(workflow.completed_at.as_ref()),
                    workflow.submission_notes,
                    ts(&workflow.created_at),
                    ts(&workflow.updated_at)
                ],
            )?;

            for step in &steps {
                tx.execute(
                    &format!(
                        "INSERT INTO approval_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, \
                         ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                    ),
                    params![
                        step.id.to_string(),
                        workflow.id.to_string(),
                        workflow.invoice_id.to_string(),
                        workflow.entity_id,
                        step.step_number,
                        step.required_role,
                        step.is_required,
                        step.assigned_to,
                        ts_opt(step.assigned_at.as_ref()),
                        step.delegated_to,
                        ts_opt(step.delegated_at.as_ref()),
                        step.delegated_reason,
                        step.status.as_str(),
                        step.acted_by,
                        ts_opt(step.acted_at.as_ref()),
                        step.action_notes,
                        ts_opt(step.due_at.as_ref()),
                        ts(&step.created_at),
                        ts(&step.updated_at)
                    ],
                )?;
            }

            let stored = fetch_workflow(&tx, workflow.id, &workflow.entity_id)?;
            let stored_steps = fetch_steps(&tx, workflow.id)?;
            tx.commit()?;
            tracing::debug!(
                workflow_id = %stored.id,
                invoice_id = %stored.invoice_id,
                total_steps = stored.total_steps,
                "Workflow persisted"
            );
            Ok((stored, stored_steps))
        })
        .await
    }

    async fn get_workflow(&self, id: Uuid, entity_id: &str) -> Result<ApprovalWorkflow> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| fetch_workflow(conn, id, &entity_id)).await
    }

    async fn get_active_workflow(
        &self,
        invoice_id: Uuid,
        entity_id: &str,
    ) -> Result<Option<ApprovalWorkflow>> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| {
            let wf = conn
                .query_row(
                    &format!(
                        "SELECT {WORKFLOW_COLUMNS} FROM approval_workflows \
                         WHERE invoice_id = ?1 AND entity_id = ?2 \
                         AND status IN ('pending', 'in_progress') \
                         ORDER BY created_at DESC LIMIT 1"
                    ),
                    params![invoice_id.to_string(), entity_id],
                    workflow_from_row,
                )
                .optional()?;
            Ok(wf)
        })
        .await
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<ApprovalStep>> {
        self.call(move |conn| fetch_steps(conn, workflow_id)).await
    }

    async fn get_step(&self, workflow_id: Uuid, step_number: u32) -> Result<ApprovalStep> {
        self.call(move |conn| fetch_step(conn, workflow_id, step_number))
            .await
    }

    async fn complete_step(
        &self,
        workflow_id: Uuid,
        step_number: u32,
        expected: StepGuard,
        outcome: StepOutcome,
        transition: WorkflowTransition,
    ) -> Result<()> {
        if let WorkflowTransition::Advance { from, .. } = transition {
            if from != step_number {
                return Err(ApprovalError::invalid_input(
                    "transition",
                    format!("advance from step {from} does not match step {step_number}"),
                ));
            }
        }

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let acted_at = ts(&outcome.acted_at);
            let changed = tx.execute(
                &format!(
                    "UPDATE approval_steps SET status = ?1, acted_by = ?2, acted_at = ?3, \
                     action_notes = ?4, updated_at = ?3 \
                     WHERE workflow_id = ?5 AND step_number = ?6 \
                     AND status IN ('pending', 'delegated') AND {}",
                    holder_guard(7)
                ),
                params![
                    outcome.status.as_str(),
                    outcome.acted_by,
                    acted_at,
                    outcome.notes,
                    workflow_id.to_string(),
                    step_number,
                    expected.status.as_str(),
                    expected.assigned_to,
                    expected.delegated_to
                ],
            )?;
            if changed == 0 {
                return Err(stale_step(step_number, "decided"));
            }

            let changed = match transition {
                WorkflowTransition::Advance { from, to } => tx.execute(
                    "UPDATE approval_workflows SET current_step = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND status = 'in_progress' AND current_step = ?4",
                    params![to, acted_at, workflow_id.to_string(), from],
                )?,
                WorkflowTransition::Finish { status, at } => tx.execute(
                    "UPDATE approval_workflows SET status = ?1, completed_at = ?2, updated_at = ?2 \
                     WHERE id = ?3 AND status = 'in_progress' AND current_step = ?4",
                    params![status.as_str(), ts(&at), workflow_id.to_string(), step_number],
                )?,
            };
            if changed == 0 {
                return Err(ApprovalError::conflict(format!(
                    "workflow {workflow_id} is no longer in progress on step {step_number}"
                )));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delegate_step(
        &self,
        workflow_id: Uuid,
        step_number: u32,
        expected: StepGuard,
        delegatee: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<ApprovalStep> {
        let delegatee = delegatee.to_string();
        let reason = reason.to_string();
        self.call(move |conn| {
            let at = ts(&at);
            let changed = conn.execute(
                &format!(
                    "UPDATE approval_steps SET status = ?1, delegated_to = ?2, delegated_at = ?3, \
                     delegated_reason = ?4, updated_at = ?3 \
                     WHERE workflow_id = ?5 AND step_number = ?6 AND {CURRENT_STEP_GUARD} AND {}",
                    holder_guard(7)
                ),
                params![
                    StepStatus::Delegated.as_str(),
                    delegatee,
                    at,
                    reason,
                    workflow_id.to_string(),
                    step_number,
                    expected.status.as_str(),
                    expected.assigned_to,
                    expected.delegated_to
                ],
            )?;
            if changed == 0 {
                return Err(stale_step(step_number, "delegated"));
            }
            fetch_step(conn, workflow_id, step_number)
        })
        .await
    }

    async fn reassign_step(
        &self,
        workflow_id: Uuid,
        step_number: u32,
        expected: StepGuard,
        assignee: &str,
        at: DateTime<Utc>,
    ) -> Result<ApprovalStep> {
        let assignee = assignee.to_string();
        self.call(move |conn| {
            let at = ts(&at);
            let changed = conn.execute(
                &format!(
                    "UPDATE approval_steps SET status = ?1, assigned_to = ?2, assigned_at = ?3, \
                     delegated_to = NULL, delegated_at = NULL, delegated_reason = NULL, \
                     updated_at = ?3 \
                     WHERE workflow_id = ?4 AND step_number = ?5 AND {CURRENT_STEP_GUARD} AND {}",
                    holder_guard(6)
                ),
                params![
                    StepStatus::Pending.as_str(),
                    assignee,
                    at,
                    workflow_id.to_string(),
                    step_number,
                    expected.status.as_str(),
                    expected.assigned_to,
                    expected.delegated_to
                ],
            )?;
            if changed == 0 {
                return Err(stale_step(step_number, "reassigned"));
            }
            fetch_step(conn, workflow_id, step_number)
        })
        .await
    }

    async fn recall_workflow(&self, workflow_id: Uuid, at: DateTime<Utc>) -> Result<Vec<ApprovalStep>> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let at = ts(&at);
            let changed = tx.execute(
                "UPDATE approval_workflows SET status = ?1, completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('pending', 'in_progress')",
                params![WorkflowStatus::Recalled.as_str(), at, workflow_id.to_string()],
            )?;
            if changed == 0 {
                return Err(ApprovalError::conflict(format!(
                    "workflow {workflow_id} is not active"
                )));
            }

            let recalled: Vec<Uuid> = fetch_steps(&tx, workflow_id)?
                .into_iter()
                .filter(|s| s.status.is_actionable())
                .map(|s| s.id)
                .collect();
            tx.execute(
                "UPDATE approval_steps SET status = ?1, updated_at = ?2 \
                 WHERE workflow_id = ?3 AND status IN ('pending', 'delegated')",
                params![StepStatus::Recalled.as_str(), at, workflow_id.to_string()],
            )?;
            let steps = fetch_steps(&tx, workflow_id)?
                .into_iter()
                .filter(|s| recalled.contains(&s.id))
                .collect();
            tx.commit()?;
            Ok(steps)
        })
        .await
    }

    async fn pending_steps_for_user(
        &self,
        entity_id: &str,
        user_id: &str,
        roles: &[String],
    ) -> Result<Vec<ApprovalStep>> {
        let entity_id = entity_id.to_string();
        let user_id = user_id.to_string();
        let roles = roles.to_vec();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {} FROM approval_steps s \
                 JOIN approval_workflows w ON w.id = s.workflow_id \
                 WHERE s.entity_id = ?1 AND w.status = 'in_progress' \
                 AND s.step_number = w.current_step \
                 AND s.status IN ('pending', 'delegated') \
                 AND (s.delegated_to = ?2 \
                      OR (s.delegated_to IS NULL AND (s.assigned_to = ?2 OR s.assigned_to IS NULL))) \
                 ORDER BY s.due_at IS NULL, s.due_at, s.created_at",
                qualified(STEP_COLUMNS, "s")
            );
            let steps = query_steps(conn, &sql, params![entity_id, user_id])?
                .into_iter()
                .filter(|s| s.current_holder().is_some() || roles.contains(&s.required_role))
                .collect();
            Ok(steps)
        })
        .await
    }

    async fn overdue_steps(&self, entity_id: &str, as_of: DateTime<Utc>) -> Result<Vec<ApprovalStep>> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {} FROM approval_steps s \
                 JOIN approval_workflows w ON w.id = s.workflow_id \
                 WHERE s.entity_id = ?1 AND w.status = 'in_progress' \
                 AND s.step_number = w.current_step \
                 AND s.status IN ('pending', 'delegated') \
                 AND s.due_at IS NOT NULL AND s.due_at < ?2 \
                 ORDER BY s.due_at, s.created_at",
                qualified(STEP_COLUMNS, "s")
            );
            query_steps(conn, &sql, params![entity_id, ts(&as_of)])
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO approval_audit_log ({AUDIT_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    entry.id.to_string(),
                    entry.invoice_id.to_string(),
                    entry.workflow_id.map(|id| id.to_string()),
                    entry.step_id.map(|id| id.to_string()),
                    entry.entity_id,
                    entry.action.as_str(),
                    entry.performed_by,
                    ts(&entry.performed_at),
                    entry.status_before.map(|s| s.as_str()),
                    entry.status_after.map(|s| s.as_str()),
                    metadata
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn audit_for_invoice(&self, invoice_id: Uuid, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| {
            query_audit(
                conn,
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM approval_audit_log \
                     WHERE invoice_id = ?1 AND entity_id = ?2 ORDER BY performed_at, seq"
                ),
                params![invoice_id.to_string(), entity_id],
            )
        })
        .await
    }

    async fn audit_for_workflow(&self, workflow_id: Uuid, entity_id: &str) -> Result<Vec<AuditEntry>> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| {
            query_audit(
                conn,
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM approval_audit_log \
                     WHERE workflow_id = ?1 AND entity_id = ?2 ORDER BY performed_at, seq"
                ),
                params![workflow_id.to_string(), entity_id],
            )
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// InvoiceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl InvoiceStore for SqliteStore {
    async fn get_invoice(&self, id: Uuid, entity_id: &str) -> Result<Invoice> {
        let entity_id = entity_id.to_string();
        self.call(move |conn| fetch_invoice(conn, id, &entity_id)).await
    }

    async fn approve_invoice(
        &self,
        id: Uuid,
        entity_id: &str,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<()> {
        let entity_id = entity_id.to_string();
        let approver = approver.to_string();
        let notes = notes.map(String::from);
        self.call(move |conn| {
            let now = ts(&Utc::now());
            let changed = conn.execute(
                "UPDATE invoices SET status = ?1, approved_by = ?2, approved_at = ?3, \
                 approval_notes = ?4, updated_at = ?3 \
                 WHERE id = ?5 AND entity_id = ?6 AND status = ?7",
                params![
                    InvoiceStatus::Approved.as_str(),
                    approver,
                    now,
                    notes,
                    id.to_string(),
                    entity_id,
                    InvoiceStatus::PendingApproval.as_str()
                ],
            )?;
            if changed == 0 {
                let current = fetch_invoice(conn, id, &entity_id)?;
                return Err(ApprovalError::conflict(format!(
                    "invoice {id} is {} and cannot be approved",
                    current.status
                )));
            }
            tracing::info!(invoice_id = %id, approver = %approver, "Invoice approved");
            Ok(())
        })
        .await
    }

    async fn update_invoice_status(
        &self,
        id: Uuid,
        entity_id: &str,
        status: InvoiceStatus,
        actor: Option<&str>,
    ) -> Result<()> {
        let entity_id = entity_id.to_string();
        let actor = actor.map(String::from);
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE invoices SET status = ?1, updated_at = ?2 WHERE id = ?3 AND entity_id = ?4",
                params![status.as_str(), ts(&Utc::now()), id.to_string(), entity_id],
            )?;
            if changed == 0 {
                return Err(ApprovalError::not_found("invoice", id.to_string()));
            }
            tracing::info!(invoice_id = %id, status = %status, actor = ?actor, "Invoice status updated");
            Ok(())
        })
        .await
    }
}
