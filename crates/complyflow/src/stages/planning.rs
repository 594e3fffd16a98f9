use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::{expect_payload, obligations_ref, tasks_ref, StageContext, StageHandler};
use crate::db::obligation_repo::{self, ObligationRow};
use crate::db::task_repo::{self, TaskRow};
use crate::db::{format_timestamp, WriteOutcome};
use crate::domain::{Category, DeadlineType, Severity, TaskPriority, TaskStatus};
use crate::error::Result;
use crate::model::schema::TASK_REFINEMENT;
use crate::model::ModelRequest;
use crate::pipeline::stage::Stage;
use crate::queue::StageMessage;

/// Derives one audit task per obligation.
pub struct Planner {
    ctx: Arc<StageContext>,
}

impl Planner {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    /// Lets the model rewrite template titles and descriptions. Any failure
    /// keeps the template tasks.
    fn refine(&self, obligations: &[ObligationRow], tasks: &mut [TaskRow]) {
        let request = ModelRequest::new(refinement_prompt(obligations, tasks));
        let refined = match self
            .ctx
            .invoker
            .invoke::<RefinementResponse>(&request, TASK_REFINEMENT)
        {
            Ok(invocation) => invocation.value.tasks,
            Err(e) => {
                log::warn!("Task refinement skipped ({}): {}", e.kind(), e);
                return;
            }
        };

        let by_obligation: HashMap<&str, &RefinedTask> =
            refined.iter().map(|t| (t.obligation_id.as_str(), t)).collect();
        let mut applied = 0;
        for task in tasks.iter_mut() {
            if let Some(r) = by_obligation.get(task.obligation_id.as_str()) {
                task.title = r.title.trim().to_string();
                task.description = r.description.trim().to_string();
                applied += 1;
            }
        }
        log::debug!("Model refined {} of {} tasks", applied, tasks.len());
    }
}

impl StageHandler for Planner {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    fn handle(&self, message: &StageMessage) -> Result<String> {
        let _span = tracing::info_span!("stage.planning", document = %message.document_id).entered();
        let doc = &message.document_id;
        let generation = &message.generation_id;
        expect_payload(message, obligations_ref(doc, generation))?;
        let output = tasks_ref(doc, generation);

        let existing = task_repo::list_for_generation(&self.ctx.db, doc, generation)?;
        if !existing.is_empty() {
            log::info!("Reusing {} stored tasks for {}/{}", existing.len(), doc, generation);
            return Ok(output);
        }

        let obligations = obligation_repo::list_for_generation(&self.ctx.db, doc, generation)?;
        if obligations.is_empty() {
            log::info!("No obligations for {}/{}, nothing to plan", doc, generation);
            return Ok(output);
        }

        let mut tasks = plan_tasks(&obligations, Utc::now());
        if self.ctx.refine_tasks {
            self.refine(&obligations, &mut tasks);
        }

        match task_repo::insert_generation(&self.ctx.db, doc, generation, &tasks)? {
            WriteOutcome::Inserted(rows) => {
                log::info!("Planned {} tasks for {}/{}", rows.len(), doc, generation)
            }
            WriteOutcome::AlreadyPresent(rows) => log::info!(
                "Tasks for {}/{} were written concurrently ({} rows)",
                doc,
                generation,
                rows.len()
            ),
        }
        Ok(output)
    }
}

/// Days from planning until a task is due.
pub fn due_in_days(severity: Severity, deadline: DeadlineType) -> i64 {
    match (deadline, severity) {
        (DeadlineType::OneTime, Severity::Critical | Severity::High) => 30,
        (DeadlineType::OneTime, _) => 60,
        (DeadlineType::Recurring, _) => 90,
        (DeadlineType::Ongoing, Severity::Critical) => 60,
        (DeadlineType::Ongoing, _) => 120,
    }
}

fn template(category: Category) -> (&'static str, &'static str) {
    match category {
        Category::Reporting => (
            "Prepare {kind} Report",
            "Collect data and prepare the required {kind} report as specified in the obligation: {obligation}",
        ),
        Category::Monitoring => (
            "Establish {kind} Monitoring System",
            "Set up monitoring systems and procedures to track compliance with: {obligation}",
        ),
        Category::Operational => (
            "Implement {kind} Operational Changes",
            "Implement necessary operational changes to comply with: {obligation}",
        ),
        Category::Financial => (
            "Calculate {kind} Financial Requirements",
            "Calculate and prepare financial requirements for compliance with: {obligation}",
        ),
    }
}

fn title_case(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Template tasks for a generation's obligations, highest priority first,
/// then earliest due date.
pub fn plan_tasks(obligations: &[ObligationRow], planned_at: DateTime<Utc>) -> Vec<TaskRow> {
    let stamp = format_timestamp(planned_at);
    let mut tasks: Vec<TaskRow> = obligations
        .iter()
        .map(|o| {
            let (title, description) = template(o.category);
            let kind = title_case(o.category.as_str());
            let due = planned_at + Duration::days(due_in_days(o.severity, o.deadline_type));
            TaskRow {
                task_id: format!("{}-task", o.obligation_id),
                obligation_id: o.obligation_id.clone(),
                document_id: o.document_id.clone(),
                generation_id: o.generation_id.clone(),
                title: title.replace("{kind}", &kind),
                description: description
                    .replace("{kind}", o.category.as_str())
                    .replace("{obligation}", &o.description),
                priority: TaskPriority::for_severity(o.severity),
                status: TaskStatus::Pending,
                assigned_to: None,
                due_date: Some(due.date_naive().to_string()),
                created_at: stamp.clone(),
                updated_at: stamp.clone(),
            }
        })
        .collect();
    tasks.sort_by(|a, b| {
        b.priority
            .rank()
            .cmp(&a.priority.rank())
            .then_with(|| a.due_date.cmp(&b.due_date))
    });
    tasks
}

#[derive(Debug, Deserialize)]
struct RefinementResponse {
    tasks: Vec<RefinedTask>,
}

#[derive(Debug, Deserialize)]
struct RefinedTask {
    obligation_id: String,
    title: String,
    description: String,
}

fn refinement_prompt(obligations: &[ObligationRow], tasks: &[TaskRow]) -> String {
    let mut prompt = String::from(
        "Rewrite each compliance task below so its title and description are specific to \
         the obligation it implements. Keep titles under 200 characters. Respond with a JSON \
         object {\"tasks\": [{\"obligation_id\", \"title\", \"description\"}]}.\n\n",
    );
    for task in tasks {
        let obligation = obligations
            .iter()
            .find(|o| o.obligation_id == task.obligation_id)
            .map(|o| o.description.as_str())
            .unwrap_or("");
        prompt.push_str(&format!(
            "- obligation_id: {}\n  obligation: {}\n  title: {}\n  description: {}\n",
            task.obligation_id, obligation, task.title, task.description
        ));
    }
    prompt
}
