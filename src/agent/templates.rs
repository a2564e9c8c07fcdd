//! Prompt rendering with Tera templates.
//!
//! Every template sees the same base context:
//!
//! | variable | contents |
//! |----------|----------|
//! | `task`   | id, instruction and any extra dataset fields |
//! | `config` | step_limit, cost_limit, sentinel, sentinels |
//! | `stats`  | n_calls, cost so far |
//! | `env`    | backend kind and working directory |
//!
//! Individual templates add their own variables (`output`, `found`,
//! `action`).

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use thiserror::Error;

use crate::execution::Observation;
use crate::task::Task;

pub const DEFAULT_SYSTEM_TEMPLATE: &str = r#"You are a helpful assistant that can interact with a computer shell to solve programming tasks.

Your response must contain exactly ONE bash code block with ONE command (or commands connected with && or ||).
Include a THOUGHT section before your command where you explain your reasoning process.

<format_example>
THOUGHT: Your reasoning and analysis here

```bash
your_command_here
```
</format_example>

Responses without exactly one bash block, or with more than one, will be rejected."#;

pub const DEFAULT_INSTANCE_TEMPLATE: &str = r#"<task_description>
{{ task.instruction }}
</task_description>

<instructions>
You are working in {{ env.cwd }} on a {{ env.kind }} backend.
Every command runs in a fresh subshell, so directory changes and environment variables do not persist between actions.
Prefix commands with `cd /path &&` when you need a specific directory.

Recommended workflow:
1. Explore the codebase to find the relevant files.
2. Write a script that reproduces the issue.
3. Edit the source code to resolve it.
4. Re-run your script to verify the fix and think about edge cases.

Do not edit test files unless the task asks for it.
{% if config.step_limit > 0 %}You have at most {{ config.step_limit }} steps.
{% endif %}
When you are done, submit your work with this command, and issue nothing else afterwards:

```bash
echo {{ config.sentinel }} && git add -A && git diff --cached
```
</instructions>"#;

pub const DEFAULT_OBSERVATION_TEMPLATE: &str = r#"<returncode>{{ output.returncode }}</returncode>
{% if output.truncated %}<warning>
The output of your last command was too long.
Please try a different command that produces less output.
If you are viewing a file, use head, tail or sed to show fewer lines.
If you are searching with grep or find, use a more selective pattern.
</warning>
<output_head>
{{ output.head }}
</output_head>
<elided_chars>{{ output.elided_chars }} characters elided</elided_chars>
<output_tail>
{{ output.tail }}
</output_tail>{% else %}<output>
{{ output.output }}
</output>{% endif %}"#;

pub const DEFAULT_FORMAT_ERROR_TEMPLATE: &str = r#"Please always provide EXACTLY ONE action in triple backticks, found {{ found }} actions.

Format your action in triple backticks as shown below.

<response_example>
Here are some thoughts about why you want to perform the action.

```{{ language }}
<action>
```
</response_example>

If you have completed your assignment, submit as described in the first message. You cannot continue working on the task after submitting."#;

pub const DEFAULT_TIMEOUT_TEMPLATE: &str = r#"The last command <command>{{ action }}</command> timed out and has been killed.
The output of the command was:
<output>
{{ output }}
</output>
Please try another command and make sure to avoid those requiring interactive input or long waits."#;

/// Template source for every prompt the agent sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    pub system_template: String,
    pub instance_template: String,
    pub action_observation_template: String,
    pub format_error_template: String,
    pub timeout_template: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            instance_template: DEFAULT_INSTANCE_TEMPLATE.to_string(),
            action_observation_template: DEFAULT_OBSERVATION_TEMPLATE.to_string(),
            format_error_template: DEFAULT_FORMAT_ERROR_TEMPLATE.to_string(),
            timeout_template: DEFAULT_TIMEOUT_TEMPLATE.to_string(),
        }
    }
}

/// Character budget for observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    /// Outputs of at least this many characters are truncated.
    pub max_output_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 10_000,
            head_chars: 5_000,
            tail_chars: 5_000,
        }
    }
}

/// Template rendering failure.
#[derive(Debug, Error)]
#[error("Failed to render template '{name}': {message}")]
pub struct TemplateError {
    pub name: String,
    pub message: String,
}

impl TemplateError {
    fn from_tera(name: &str, error: &tera::Error) -> Self {
        // Tera keeps the useful detail in the source chain.
        let mut message = error.to_string();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            name: name.to_string(),
            message,
        }
    }
}

/// The `config` variable.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigVars {
    pub step_limit: usize,
    pub cost_limit: f64,
    /// Preferred sentinel, the first configured one.
    pub sentinel: String,
    pub sentinels: Vec<String>,
}

/// The `stats` variable.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsVars {
    pub n_calls: usize,
    pub cost: f64,
}

/// The `env` variable.
#[derive(Debug, Clone, Serialize)]
pub struct EnvVars {
    pub kind: String,
    pub cwd: String,
}

/// Base variables shared by every template.
#[derive(Debug, Clone, Serialize)]
pub struct RenderVars<'a> {
    pub task: &'a Task,
    pub config: ConfigVars,
    pub stats: StatsVars,
    pub env: EnvVars,
}

impl RenderVars<'_> {
    fn context(&self, template: &str) -> Result<Context, TemplateError> {
        Context::from_serialize(self).map_err(|e| TemplateError::from_tera(template, &e))
    }
}

/// Observation split for display, counted in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservationView {
    pub returncode: i32,
    pub output: String,
    pub truncated: bool,
    pub head: String,
    pub tail: String,
    pub elided_chars: usize,
    pub total_chars: usize,
}

impl ObservationView {
    pub fn new(observation: &Observation, budget: &TruncationConfig) -> Self {
        let output = &observation.output;
        let total_chars = output.chars().count();

        if total_chars < budget.max_output_chars {
            return Self {
                returncode: observation.return_code,
                output: output.clone(),
                truncated: false,
                head: String::new(),
                tail: String::new(),
                elided_chars: 0,
                total_chars,
            };
        }

        let head_chars = budget.head_chars.min(total_chars);
        let tail_chars = budget.tail_chars.min(total_chars - head_chars);
        let head: String = output.chars().take(head_chars).collect();
        let tail: String = output.chars().skip(total_chars - tail_chars).collect();

        Self {
            returncode: observation.return_code,
            output: output.clone(),
            truncated: true,
            head,
            tail,
            elided_chars: total_chars - head_chars - tail_chars,
            total_chars,
        }
    }
}

const SYSTEM: &str = "system_template";
const INSTANCE: &str = "instance_template";
const OBSERVATION: &str = "action_observation_template";
const FORMAT_ERROR: &str = "format_error_template";
const TIMEOUT: &str = "timeout_template";

/// Renders the agent's prompts from a compiled template set.
pub struct PromptRenderer {
    tera: Tera,
    truncation: TruncationConfig,
}

impl PromptRenderer {
    /// Compiles all templates up front so syntax errors surface before a
    /// task starts.
    pub fn new(
        templates: &PromptTemplates,
        truncation: TruncationConfig,
    ) -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        for (name, source) in [
            (SYSTEM, &templates.system_template),
            (INSTANCE, &templates.instance_template),
            (OBSERVATION, &templates.action_observation_template),
            (FORMAT_ERROR, &templates.format_error_template),
            (TIMEOUT, &templates.timeout_template),
        ] {
            tera.add_raw_template(name, source)
                .map_err(|e| TemplateError::from_tera(name, &e))?;
        }
        Ok(Self { tera, truncation })
    }

    pub fn render_system(&self, vars: &RenderVars<'_>) -> Result<String, TemplateError> {
        self.render(SYSTEM, vars.context(SYSTEM)?)
    }

    pub fn render_instance(&self, vars: &RenderVars<'_>) -> Result<String, TemplateError> {
        self.render(INSTANCE, vars.context(INSTANCE)?)
    }

    pub fn render_observation(
        &self,
        vars: &RenderVars<'_>,
        observation: &Observation,
    ) -> Result<String, TemplateError> {
        let mut context = vars.context(OBSERVATION)?;
        context.insert("output", &ObservationView::new(observation, &self.truncation));
        self.render(OBSERVATION, context)
    }

    pub fn render_format_error(
        &self,
        vars: &RenderVars<'_>,
        found: usize,
        language: &str,
    ) -> Result<String, TemplateError> {
        let mut context = vars.context(FORMAT_ERROR)?;
        context.insert("found", &found);
        context.insert("language", language);
        self.render(FORMAT_ERROR, context)
    }

    pub fn render_timeout(
        &self,
        vars: &RenderVars<'_>,
        action: &str,
        partial_output: &str,
    ) -> Result<String, TemplateError> {
        let mut context = vars.context(TIMEOUT)?;
        context.insert("action", action);
        context.insert("output", partial_output);
        self.render(TIMEOUT, context)
    }

    /// Renders an ad-hoc template string, such as a startup command.
    pub fn render_str(
        &self,
        name: &str,
        source: &str,
        vars: &RenderVars<'_>,
    ) -> Result<String, TemplateError> {
        Tera::one_off(source, &vars.context(name)?, false)
            .map_err(|e| TemplateError::from_tera(name, &e))
    }

    fn render(&self, name: &str, context: Context) -> Result<String, TemplateError> {
        self.tera
            .render(name, &context)
            .map_err(|e| TemplateError::from_tera(name, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(task: &Task) -> RenderVars<'_> {
        RenderVars {
            task,
            config: ConfigVars {
                step_limit: 10,
                cost_limit: 1.0,
                sentinel: "TASK_COMPLETE".to_string(),
                sentinels: vec!["TASK_COMPLETE".to_string()],
            },
            stats: StatsVars::default(),
            env: EnvVars {
                kind: "local".to_string(),
                cwd: "/repo".to_string(),
            },
        }
    }

    fn renderer() -> PromptRenderer {
        PromptRenderer::new(&PromptTemplates::default(), TruncationConfig::default())
            .expect("default templates compile")
    }

    #[test]
    fn test_instance_substitutes_instruction_and_sentinel() {
        let task = Task::new("t1", "Fix the off-by-one in parse()");
        let text = renderer().render_instance(&vars(&task)).expect("render");

        assert!(text.contains("Fix the off-by-one in parse()"));
        assert!(text.contains("echo TASK_COMPLETE"));
        assert!(text.contains("at most 10 steps"));
        assert!(text.contains("/repo"));
    }

    #[test]
    fn test_short_observation_is_shown_in_full() {
        let task = Task::new("t", "x");
        let obs = Observation::new("Success!\nWarning: minor issue", 0);
        let text = renderer().render_observation(&vars(&task), &obs).expect("render");

        assert!(text.contains("<returncode>0</returncode>"));
        assert!(text.contains("<output>\nSuccess!\nWarning: minor issue\n</output>"));
        assert!(!text.contains("<output_head>"));
        assert!(!text.contains("<warning>"));
    }

    #[test]
    fn test_long_observation_elides_middle() {
        let task = Task::new("t", "x");
        let output = format!("{}{}{}", "A".repeat(6000), "M".repeat(1000), "B".repeat(6000));
        let obs = Observation::new(output, 1);
        let text = renderer().render_observation(&vars(&task), &obs).expect("render");

        assert!(text.contains("<returncode>1</returncode>"));
        assert!(text.contains("<warning>"));
        assert!(text.contains("<elided_chars>3000 characters elided</elided_chars>"));
        assert!(!text.contains("MMMM"));

        let head = &text[text.find("<output_head>").expect("head")..text.find("</output_head>").expect("head end")];
        assert!(head.contains("AAAA"));
        let tail = &text[text.find("<output_tail>").expect("tail")..text.find("</output_tail>").expect("tail end")];
        assert!(tail.contains("BBBB"));
    }

    #[test]
    fn test_truncation_boundary() {
        let budget = TruncationConfig::default();
        let under = ObservationView::new(&Observation::new("Y".repeat(9_999), 0), &budget);
        assert!(!under.truncated);

        let exact = ObservationView::new(&Observation::new("X".repeat(10_000), 0), &budget);
        assert!(exact.truncated);
        assert_eq!(exact.elided_chars, 0);
        assert_eq!(exact.head.len() + exact.tail.len(), 10_000);
    }

    #[test]
    fn test_truncation_counts_characters_not_bytes() {
        let budget = TruncationConfig {
            max_output_chars: 10,
            head_chars: 3,
            tail_chars: 2,
        };
        let view = ObservationView::new(&Observation::new("ééééééééééé", 0), &budget);

        assert_eq!(view.total_chars, 11);
        assert_eq!(view.head, "ééé");
        assert_eq!(view.tail, "éé");
        assert_eq!(view.elided_chars, 6);
    }

    #[test]
    fn test_format_error_reports_count() {
        let task = Task::new("t", "x");
        let text = renderer()
            .render_format_error(&vars(&task), 2, "bash")
            .expect("render");
        assert!(text.starts_with(
            "Please always provide EXACTLY ONE action in triple backticks, found 2 actions."
        ));
        assert!(text.contains("```bash"));
    }

    #[test]
    fn test_timeout_keeps_partial_output() {
        let task = Task::new("t", "x");
        let text = renderer()
            .render_timeout(&vars(&task), "sleep 100", "partial line")
            .expect("render");
        assert!(text.contains("timed out"));
        assert!(text.contains("<command>sleep 100</command>"));
        assert!(text.contains("partial line"));
    }

    #[test]
    fn test_extra_fields_reach_templates() {
        let templates = PromptTemplates {
            instance_template: "{{ task.repo }}: {{ task.instruction }}".to_string(),
            ..Default::default()
        };
        let renderer = PromptRenderer::new(&templates, TruncationConfig::default()).expect("compile");
        let task = Task::new("t", "fix").with_extra("repo", serde_json::json!("django/django"));

        assert_eq!(
            renderer.render_instance(&vars(&task)).expect("render"),
            "django/django: fix"
        );
    }

    #[test]
    fn test_invalid_template_is_reported_by_name() {
        let templates = PromptTemplates {
            system_template: "{% if %}".to_string(),
            ..Default::default()
        };
        let err = PromptRenderer::new(&templates, TruncationConfig::default())
            .err()
            .expect("should fail");
        assert_eq!(err.name, "system_template");
    }

    #[test]
    fn test_output_is_not_html_escaped() {
        let task = Task::new("t", "x");
        let obs = Observation::new("<div> & \"quotes\"", 0);
        let text = renderer().render_observation(&vars(&task), &obs).expect("render");
        assert!(text.contains("<div> & \"quotes\""));
    }
}
