//! Prompt document rendering for the prompt-generation phase.

use serde::Serialize;
use tera::{Context, Tera};

use super::types::{GeneratedPrompt, PipelineContext, SubtaskData};

const CATEGORY_TEMPLATE_NAME: &str = "category_prompt";

const CATEGORY_TEMPLATE: &str = r#"# {{ category | title }} implementation

Task: {{ task_id }}
{% if tech_stack %}Tech stack: {{ tech_stack | join(sep=", ") }}
{% endif %}{% if coding_standards %}
## Coding standards
{% for standard in coding_standards %}- {{ standard }}
{% endfor %}{% endif %}
## Subtasks
{% for subtask in subtasks %}
### {{ loop.index }}. {{ subtask.title }}
{{ subtask.description }}
{% if subtask.priority %}Priority: {{ subtask.priority }}
{% endif %}{% if subtask.estimatedEffort %}Estimated effort: {{ subtask.estimatedEffort }}
{% endif %}{% if subtask.requirements %}Requirements:
{% for req in subtask.requirements %}- {{ req }}
{% endfor %}{% endif %}{% if subtask.dependencies %}Depends on: {{ subtask.dependencies | join(sep=", ") }}
{% endif %}{% endfor %}"#;

#[derive(Serialize)]
struct CategoryView<'a> {
    category: &'a str,
    task_id: &'a str,
    tech_stack: &'a [String],
    coding_standards: &'a [String],
    subtasks: Vec<&'a SubtaskData>,
}

/// Renders one prompt per subtask category.
pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    pub fn new() -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_template(CATEGORY_TEMPLATE_NAME, CATEGORY_TEMPLATE)?;
        Ok(Self { tera })
    }

    /// Groups `subtasks` by category in first-appearance order and renders
    /// each group. No subtasks yields no prompts.
    pub fn render(
        &self,
        context: &PipelineContext,
        subtasks: &[SubtaskData],
    ) -> Result<Vec<GeneratedPrompt>, tera::Error> {
        group_by_category(subtasks)
            .into_iter()
            .map(|(category, members)| {
                let view = CategoryView {
                    category,
                    task_id: &context.task_id,
                    tech_stack: &context.tech_stack,
                    coding_standards: &context.coding_standards,
                    subtasks: members,
                };
                let subtask_count = view.subtasks.len();
                let content = self
                    .tera
                    .render(CATEGORY_TEMPLATE_NAME, &Context::from_serialize(&view)?)?;

                Ok(GeneratedPrompt {
                    category: category.to_string(),
                    title: format!("{} implementation prompt", category),
                    content,
                    subtask_count,
                })
            })
            .collect()
    }
}

fn group_by_category(subtasks: &[SubtaskData]) -> Vec<(&str, Vec<&SubtaskData>)> {
    let mut groups: Vec<(&str, Vec<&SubtaskData>)> = Vec::new();
    for subtask in subtasks {
        match groups.iter_mut().find(|(c, _)| *c == subtask.category) {
            Some((_, members)) => members.push(subtask),
            None => groups.push((subtask.category.as_str(), vec![subtask])),
        }
    }
    groups
}
