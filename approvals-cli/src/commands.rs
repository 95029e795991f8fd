//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::InvoiceAction;
use crate::RuleAction;
use approvals_core::config::{self, ApprovalsConfig};
use approvals_core::identity::StaticIdentityResolver;
use approvals_core::notify::TracingPublisher;
use approvals_core::{
    ApprovalRouter, ApprovalRule, ApprovalStep, AuditEntry, Collaborators, InvoiceLine,
    InvoiceStore, NewInvoice, RuleStep, RuleStore, RuleType, SqliteStore,
};
use std::path::Path;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: ApprovalsConfig,
    workspace: &Path,
    entity: &str,
) -> anyhow::Result<()> {
    match command {
        Commands::Init => handle_init(&config, workspace),
        Commands::Config { action } => handle_config(action, &config, workspace),
        Commands::Rule { action } => handle_rule(action, &config, workspace, entity).await,
        Commands::Invoice { action } => handle_invoice(action, &config, workspace, entity).await,
        command => handle_workflow(command, &config, workspace, entity).await,
    }
}

fn handle_init(config: &ApprovalsConfig, workspace: &Path) -> anyhow::Result<()> {
    if config::workspace_config_path(workspace).exists() {
        println!(
            "Configuration already exists at: {}",
            config::workspace_config_path(workspace).display()
        );
    } else {
        let path = config::write_workspace_config(workspace, &ApprovalsConfig::default())?;
        println!("Created default configuration at: {}", path.display());
    }
    let db_path = config.database_path(workspace);
    SqliteStore::open(&db_path)?;
    println!("Database ready at: {}", db_path.display());
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    config: &ApprovalsConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = config::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            let path = config::write_workspace_config(workspace, &ApprovalsConfig::default())?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let problems = config.validate();
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            for problem in &problems {
                eprintln!("warning: {}", problem);
            }
            Ok(())
        }
    }
}

fn open_store(config: &ApprovalsConfig, workspace: &Path) -> anyhow::Result<SqliteStore> {
    config
        .ensure_valid()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    Ok(SqliteStore::open(config.database_path(workspace))?)
}

fn build_router(config: &ApprovalsConfig, store: SqliteStore) -> ApprovalRouter {
    let identity = StaticIdentityResolver::from_roles(config.identity.roles.clone());
    ApprovalRouter::new(
        Collaborators::sqlite(store, Arc::new(identity), Arc::new(TracingPublisher)),
        &config.routing,
    )
}

async fn handle_rule(
    action: RuleAction,
    config: &ApprovalsConfig,
    workspace: &Path,
    entity: &str,
) -> anyhow::Result<()> {
    let store = open_store(config, workspace)?;
    match action {
        RuleAction::Add {
            name,
            rule_type,
            steps,
            priority,
            min,
            max,
            vendor,
            department,
        } => {
            let rule_type: RuleType = rule_type.parse()?;
            let mut rule = ApprovalRule::new(entity, name, rule_type, step_template(&steps), priority)
                .with_amount_range(min, max);
            rule.vendor_id = vendor;
            rule.department = department;
            let rule = store.create_rule(rule).await?;
            println!("Created rule {} ({})", rule.name, rule.id);
            Ok(())
        }
        RuleAction::List { all } => {
            let rules = store.list_rules(entity, !all).await?;
            if rules.is_empty() {
                println!("No approval rules for entity '{}'.", entity);
                return Ok(());
            }
            println!("Approval rules ({}):", rules.len());
            for rule in &rules {
                println!("  {}", format_rule(rule));
            }
            Ok(())
        }
        RuleAction::Disable { id } => {
            let mut rule = store.get_rule(id, entity).await?;
            rule.is_active = false;
            let rule = store.update_rule(rule).await?;
            println!("Disabled rule {} ({})", rule.name, rule.id);
            Ok(())
        }
        RuleAction::Remove { id } => {
            store.delete_rule(id, entity).await?;
            println!("Removed rule {}", id);
            Ok(())
        }
    }
}

async fn handle_invoice(
    action: InvoiceAction,
    config: &ApprovalsConfig,
    workspace: &Path,
    entity: &str,
) -> anyhow::Result<()> {
    let store = open_store(config, workspace)?;
    match action {
        InvoiceAction::Add {
            vendor,
            number,
            lines,
            description,
        } => {
            let lines = lines
                .iter()
                .enumerate()
                .map(|(idx, raw)| parse_line(idx as u32 + 1, raw, &description))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let invoice = store
                .create_invoice(NewInvoice {
                    entity_id: entity.to_string(),
                    vendor_id: vendor,
                    invoice_number: number,
                    lines,
                })
                .await?;
            println!(
                "Created draft invoice {} ({}), total {}",
                invoice.invoice_number, invoice.id, invoice.total_amount
            );
            Ok(())
        }
        InvoiceAction::Show { id } => {
            let invoice = store.get_invoice(id, entity).await?;
            println!("{}", serde_json::to_string_pretty(&invoice)?);
            Ok(())
        }
    }
}

async fn handle_workflow(
    command: Commands,
    config: &ApprovalsConfig,
    workspace: &Path,
    entity: &str,
) -> anyhow::Result<()> {
    let router = build_router(config, open_store(config, workspace)?);
    match command {
        Commands::Submit {
            invoice,
            user,
            notes,
        } => {
            let (workflow, steps) = router
                .submit_for_approval(invoice, entity, &user, notes.as_deref())
                .await?;
            println!(
                "Submitted invoice {} as workflow {} ({} step(s))",
                invoice, workflow.id, workflow.total_steps
            );
            print_steps(&steps);
        }
        Commands::Approve {
            invoice,
            workflow,
            step,
            user,
            notes,
        } => {
            let complete = router
                .approve_step(entity, invoice, workflow, step, &user, notes.as_deref())
                .await?;
            if complete {
                println!("Step {} approved. Invoice {} is approved.", step, invoice);
            } else {
                println!("Step {} approved. Workflow advanced to step {}.", step, step + 1);
            }
        }
        Commands::Reject {
            invoice,
            workflow,
            step,
            user,
            reason,
        } => {
            router
                .reject_workflow(entity, invoice, workflow, step, &user, &reason)
                .await?;
            println!("Workflow {} rejected. Invoice {} is back in draft.", workflow, invoice);
        }
        Commands::Recall {
            invoice,
            workflow,
            user,
        } => {
            router
                .recall_workflow(entity, invoice, workflow, &user)
                .await?;
            println!("Workflow {} recalled. Invoice {} is back in draft.", workflow, invoice);
        }
        Commands::Delegate {
            workflow,
            step,
            user,
            to,
            reason,
        } => {
            let step = router
                .delegate_step(entity, workflow, step, &user, &to, &reason)
                .await?;
            println!("Delegated: {}", format_step(&step));
        }
        Commands::Reassign {
            workflow,
            step,
            user,
            to,
        } => {
            let step = router
                .reassign_step(entity, workflow, step, &user, &to)
                .await?;
            println!("Reassigned: {}", format_step(&step));
        }
        Commands::Pending { user } => {
            let steps = router.get_pending_approvals(entity, &user).await?;
            if steps.is_empty() {
                println!("Nothing awaiting {}.", user);
            } else {
                println!("Awaiting {} ({}):", user, steps.len());
                print_steps(&steps);
            }
        }
        Commands::Steps { invoice } => {
            let steps = router.get_workflow_steps(invoice, entity).await?;
            print_steps(&steps);
        }
        Commands::History { invoice, workflow } => {
            let entries = match workflow {
                Some(workflow) => router.get_workflow_history(workflow, entity).await?,
                None => router.get_approval_history(invoice, entity).await?,
            };
            if entries.is_empty() {
                println!("No audit entries.");
            }
            for entry in &entries {
                println!("  {}", format_audit(entry));
            }
        }
        Commands::Overdue => {
            let steps = router.get_overdue_steps(entity, chrono::Utc::now()).await?;
            if steps.is_empty() {
                println!("No overdue steps.");
            } else {
                print_steps(&steps);
            }
        }
        other => anyhow::bail!("'{:?}' is not a workflow command", other),
    }
    Ok(())
}

/// Number roles 1..N in the order given.
fn step_template(roles: &[String]) -> Vec<RuleStep> {
    roles
        .iter()
        .enumerate()
        .map(|(idx, role)| RuleStep::new(idx as u32 + 1, role.trim(), true))
        .collect()
}

/// Parse `ACCOUNT:AMOUNT[:TAX[:DEPARTMENT]]`.
fn parse_line(line_number: u32, raw: &str, description: &str) -> anyhow::Result<InvoiceLine> {
    let mut parts = raw.split(':');
    let account_id = parts
        .next()
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("line '{}' is missing an account", raw))?;
    let amount = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("line '{}' is missing an amount", raw))?
        .trim()
        .parse::<i64>()
        .map_err(|e| anyhow::anyhow!("line '{}' has an invalid amount: {}", raw, e))?;
    let tax_amount = match parts.next() {
        Some(tax) if !tax.trim().is_empty() => tax
            .trim()
            .parse::<i64>()
            .map_err(|e| anyhow::anyhow!("line '{}' has an invalid tax amount: {}", raw, e))?,
        _ => 0,
    };
    let department = parts
        .next()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from);
    if parts.next().is_some() {
        anyhow::bail!("line '{}' has too many fields", raw);
    }
    Ok(InvoiceLine {
        line_number,
        account_id: account_id.trim().to_string(),
        description: description.to_string(),
        amount,
        tax_amount,
        department,
    })
}

fn print_steps(steps: &[ApprovalStep]) {
    for step in steps {
        println!("  {}", format_step(step));
    }
}

fn format_rule(rule: &ApprovalRule) -> String {
    let roles: Vec<&str> = rule.steps.iter().map(|s| s.role.as_str()).collect();
    let mut criteria = Vec::new();
    if let Some(min) = rule.min_amount {
        criteria.push(format!("min={}", min));
    }
    if let Some(max) = rule.max_amount {
        criteria.push(format!("max={}", max));
    }
    if let Some(vendor) = &rule.vendor_id {
        criteria.push(format!("vendor={}", vendor));
    }
    if let Some(dept) = &rule.department {
        criteria.push(format!("department={}", dept));
    }
    format!(
        "[{}] {} {} ({}){} steps: {} id: {}",
        rule.priority,
        rule.name,
        rule.rule_type,
        criteria.join(", "),
        if rule.is_active { "" } else { " inactive" },
        roles.join(" -> "),
        rule.id
    )
}

fn format_step(step: &ApprovalStep) -> String {
    let holder = step.current_holder().unwrap_or("unassigned");
    let due = step
        .due_at
        .map(|d| format!(" due {}", d.format("%Y-%m-%d %H:%M")))
        .unwrap_or_default();
    format!(
        "#{} {} [{}] holder: {} workflow: {}{}",
        step.step_number, step.required_role, step.status, holder, step.workflow_id, due
    )
}

fn format_audit(entry: &AuditEntry) -> String {
    let transition = match (entry.status_before, entry.status_after) {
        (Some(before), Some(after)) if before != after => format!(" {} -> {}", before, after),
        _ => String::new(),
    };
    let meta = if entry.metadata.is_empty() {
        String::new()
    } else {
        format!(" {}", serde_json::Value::Object(entry.metadata.clone()))
    };
    format!(
        "{} {} by {}{}{}",
        entry.performed_at.format("%Y-%m-%d %H:%M:%S"),
        entry.action,
        entry.performed_by,
        transition,
        meta
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approvals_core::StepStatus;
    use tempfile::TempDir;

    fn workspace_config(dir: &Path) -> ApprovalsConfig {
        let mut config = ApprovalsConfig::default();
        config.database.path = dir.join("approvals.db");
        config
            .identity
            .roles
            .insert("FINANCE_MANAGER".into(), vec!["fm".into()]);
        config
    }

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        handle_config(ConfigAction::Init, &ApprovalsConfig::default(), workspace).unwrap();

        let config_path = config::workspace_config_path(workspace);
        assert!(config_path.exists());
        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: ApprovalsConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.routing.default_role, "FINANCE_MANAGER");
    }

    #[test]
    fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let config_path = config::workspace_config_path(workspace);
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "[routing]\ndefault_role = \"AP_LEAD\"\n").unwrap();

        handle_config(ConfigAction::Init, &ApprovalsConfig::default(), workspace).unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("AP_LEAD"));
    }

    #[test]
    fn test_parse_line_variants() {
        let line = parse_line(1, "6100:5000", "rent").unwrap();
        assert_eq!(line.account_id, "6100");
        assert_eq!(line.amount, 5000);
        assert_eq!(line.tax_amount, 0);
        assert_eq!(line.department, None);

        let line = parse_line(2, "6200:1000:80:ops", "").unwrap();
        assert_eq!(line.line_number, 2);
        assert_eq!(line.tax_amount, 80);
        assert_eq!(line.department.as_deref(), Some("ops"));

        let line = parse_line(3, "6300:10::ops", "").unwrap();
        assert_eq!(line.tax_amount, 0);
        assert_eq!(line.department.as_deref(), Some("ops"));

        assert!(parse_line(1, "6100", "").is_err());
        assert!(parse_line(1, ":100", "").is_err());
        assert!(parse_line(1, "6100:abc", "").is_err());
        assert!(parse_line(1, "6100:1:2:ops:extra", "").is_err());
    }

    #[test]
    fn test_step_template_numbers_in_order() {
        let steps = step_template(&["CLERK".into(), " CFO ".into()]);
        assert_eq!(steps[0], RuleStep::new(1, "CLERK", true));
        assert_eq!(steps[1], RuleStep::new(2, "CFO", true));
    }

    #[tokio::test]
    async fn test_invoice_add_rejects_duplicate_number() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let config = workspace_config(workspace);
        let add = || Commands::Invoice {
            action: InvoiceAction::Add {
                vendor: "acme-supplies".into(),
                number: "A-100".into(),
                lines: vec!["6100:2500".into(), "6200:500:40:ops".into()],
                description: "paper".into(),
            },
        };

        handle_command(add(), config.clone(), workspace, "default")
            .await
            .unwrap();
        assert!(
            handle_command(add(), config, workspace, "default")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_submit_and_approve_through_commands() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let config = workspace_config(workspace);
        let store = SqliteStore::open(config.database_path(workspace)).unwrap();
        let invoice = store
            .create_invoice(NewInvoice {
                entity_id: "default".into(),
                vendor_id: "acme-supplies".into(),
                invoice_number: "A-101".into(),
                lines: vec![parse_line(1, "6100:100", "toner").unwrap()],
            })
            .await
            .unwrap();

        handle_command(
            Commands::Submit {
                invoice: invoice.id,
                user: "alice".into(),
                notes: None,
            },
            config.clone(),
            workspace,
            "default",
        )
        .await
        .unwrap();

        let router = build_router(&config, store.clone());
        let steps = router.get_workflow_steps(invoice.id, "default").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert_eq!(steps[0].assigned_to.as_deref(), Some("fm"));

        handle_command(
            Commands::Approve {
                invoice: invoice.id,
                workflow: steps[0].workflow_id,
                step: 1,
                user: "fm".into(),
                notes: None,
            },
            config,
            workspace,
            "default",
        )
        .await
        .unwrap();

        let invoice = store.get_invoice(invoice.id, "default").await.unwrap();
        assert_eq!(invoice.status, approvals_core::InvoiceStatus::Approved);
        let history = router.get_approval_history(invoice.id, "default").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_rule_add_rejects_unknown_type() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let err = handle_command(
            Commands::Rule {
                action: RuleAction::Add {
                    name: "bad".into(),
                    rule_type: "size_based".into(),
                    steps: vec!["CLERK".into()],
                    priority: 0,
                    min: None,
                    max: None,
                    vendor: None,
                    department: None,
                },
            },
            workspace_config(workspace),
            workspace,
            "default",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("size_based"));
    }

    #[test]
    fn test_format_step_shows_holder() {
        let mut step = ApprovalStep::pending(1, "CLERK", true);
        assert!(format_step(&step).contains("holder: unassigned"));
        step.assigned_to = Some("bob".into());
        step.delegated_to = Some("dave".into());
        assert!(format_step(&step).contains("holder: dave"));
    }
}
