//! Iteration prompt rendering.
//!
//! The instruction prompt is deliberately fixed: one pending task per
//! iteration, verification before completion, a progress note, a commit.
//! Only the sprint context varies between renders.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::sentinel::COMPLETION_SENTINEL;
use crate::io::paths::{SANDBOX_PROGRESS_REL, SANDBOX_TASKS_REL};

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Context for one iteration's prompt.
#[derive(Debug, Clone)]
pub struct IterationPrompt<'a> {
    pub sprint_name: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
}

pub fn render_iteration_prompt(input: &IterationPrompt<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("iteration", ITERATION_TEMPLATE)
        .expect("iteration template should be valid");
    let template = env.get_template("iteration")?;
    let rendered = template
        .render(context! {
            sprint_name => input.sprint_name,
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            tasks_path => SANDBOX_TASKS_REL,
            progress_path => SANDBOX_PROGRESS_REL,
            sentinel => COMPLETION_SENTINEL,
        })
        .context("render iteration prompt")?;
    Ok(rendered)
}
