use colored::*;
use csps_common::MigrationId;
use csps_db::migrations::{MigrationStatus, PlannedMigration, RunReport};
use csps_display::StatusDescriptor;

pub fn print_plan(plan: &[PlannedMigration]) {
    if plan.is_empty() {
        println!("{}", "Schema is up to date.".green());
        return;
    }

    println!(
        "{} {} migration(s) would run (dry run)",
        "Plan:".cyan().bold(),
        plan.len()
    );
    for unit in plan {
        println!();
        println!("  {} {}", unit.id.to_string().yellow(), unit.name.bold());
        for (i, statement) in unit.statements.iter().enumerate() {
            println!(
                "    {} {}",
                format!("[{}/{}]", i + 1, unit.statements.len()).dimmed(),
                statement
            );
        }
    }
}

pub fn print_run(report: &RunReport) {
    if report.applied.is_empty() {
        println!("{}", "No migrations to apply.".green());
        return;
    }
    for record in &report.applied {
        println!("  {} {} {}", "✓".green(), record.id.to_string().yellow(), record.name);
    }
    println!(
        "{}",
        format!("✓ {} migration(s) applied", report.applied.len())
            .green()
            .bold()
    );
}

pub fn print_reverted(reverted: &[MigrationId]) {
    if reverted.is_empty() {
        println!("{}", "Nothing to revert.".yellow());
        return;
    }
    for id in reverted {
        println!("  {} {}", "↩".cyan(), id.to_string().yellow());
    }
    println!(
        "{}",
        format!("✓ {} migration(s) reverted", reverted.len())
            .green()
            .bold()
    );
}

pub fn print_status(status: &MigrationStatus, target: &str) {
    println!("{}", "Migration Status".cyan().bold());
    println!();
    println!("  Database: {}", target.yellow());
    match status.current_version() {
        Some(version) => println!("  Version:  {}", version.to_string().green()),
        None => println!("  Version:  {}", "none".dimmed()),
    }
    println!();

    for unit in &status.applied {
        let when = unit
            .applied_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let marker = if status.drifted.contains(&unit.id) {
            "!".red().bold()
        } else {
            "✓".green()
        };
        println!(
            "  {} {} {:<32} {}",
            marker,
            unit.id,
            unit.name,
            when.dimmed()
        );
    }
    for unit in &status.pending {
        let note = if unit.reversible { "" } else { "irreversible" };
        println!(
            "  {} {} {:<32} {}",
            "○".dimmed(),
            unit.id,
            unit.name,
            note.yellow()
        );
    }
    for record in &status.unknown {
        println!(
            "  {} {} {:<32} {}",
            "?".red(),
            record.id,
            record.name,
            "not in code".red()
        );
    }

    println!();
    println!(
        "  {} applied, {} pending",
        status.applied.len().to_string().green(),
        status.pending.len().to_string().yellow()
    );
    if !status.drifted.is_empty() {
        println!(
            "  {} {} applied migration(s) changed since they ran",
            "⚠".yellow(),
            status.drifted.len()
        );
    }
    if !status.unknown.is_empty() {
        println!(
            "  {} ledger references migrations missing from this build",
            "⚠".red()
        );
    }
}

pub fn print_label(code: &str, descriptor: &StatusDescriptor) {
    println!(
        "{} → {} ({} → {})",
        code.dimmed(),
        descriptor.label.bold(),
        descriptor.gradient[0],
        descriptor.gradient[1]
    );
}
