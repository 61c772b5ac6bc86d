//! Analytical report assembly: fixed section set, Markdown rendering, and
//! the section-to-source map persisted alongside.

use serde::{Deserialize, Serialize};

use crate::model::Task;

/// Canonical section order. Missing sections are rendered with a stub so
/// every report has the same shape.
pub const REPORT_SECTIONS: [&str; 4] = [
    "key_findings",
    "evidence_analysis",
    "causal_relationships",
    "alternative_interpretations",
];

/// Contract for `synthesize_report`.
#[derive(Debug, Deserialize)]
pub struct ReportResponse {
    pub sections: Vec<ReportSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub name: String,
    pub markdown: String,
    #[serde(default)]
    pub source_ids: Vec<String>,
}

fn section_title(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the final Markdown document and the `(section, source_id)` rows
/// to persist with it. Unknown sections from the model are appended after
/// the canonical four; unknown source ids are filtered by the caller.
pub fn render_markdown(
    task: &Task,
    sections: &[ReportSection],
) -> (String, Vec<(String, String)>) {
    let mut markdown = format!("# {}\n\n", task.title);
    markdown.push_str(&format!("> {}\n\n", task.research_query));

    let mut section_sources = Vec::new();

    for name in REPORT_SECTIONS {
        match sections.iter().find(|s| s.name == name) {
            Some(section) => {
                markdown.push_str(&format!(
                    "## {}\n\n{}\n\n",
                    section_title(&section.name),
                    section.markdown.trim()
                ));
                for source_id in &section.source_ids {
                    section_sources.push((section.name.clone(), source_id.clone()));
                }
            }
            None => {
                markdown.push_str(&format!(
                    "## {}\n\nNo findings for this section.\n\n",
                    section_title(name)
                ));
            }
        }
    }

    for section in sections {
        if !REPORT_SECTIONS.contains(&section.name.as_str()) {
            markdown.push_str(&format!(
                "## {}\n\n{}\n\n",
                section_title(&section.name),
                section.markdown.trim()
            ));
            for source_id in &section.source_ids {
                section_sources.push((section.name.clone(), source_id.clone()));
            }
        }
    }

    (markdown, section_sources)
}

/// Report for a run that found no sources at all. The task still completes;
/// the document says so explicitly.
pub fn empty_report(task: &Task) -> (String, Vec<(String, String)>) {
    let sections: Vec<ReportSection> = REPORT_SECTIONS
        .iter()
        .map(|name| ReportSection {
            name: name.to_string(),
            markdown: "No sources found for this research query.".to_string(),
            source_ids: vec![],
        })
        .collect();
    render_markdown(task, &sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResearchType;

    #[test]
    fn test_render_covers_all_sections() {
        let task = Task::new("AI agents", "impact", ResearchType::AnalyticalReport);
        let sections = vec![ReportSection {
            name: "key_findings".into(),
            markdown: "Agents matter.".into(),
            source_ids: vec!["s1".into(), "s2".into()],
        }];

        let (markdown, sources) = render_markdown(&task, &sections);
        assert!(markdown.starts_with("# AI agents"));
        assert!(markdown.contains("## Key Findings"));
        assert!(markdown.contains("Agents matter."));
        assert!(markdown.contains("## Evidence Analysis"));
        assert!(markdown.contains("No findings for this section."));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0], ("key_findings".to_string(), "s1".to_string()));
    }

    #[test]
    fn test_empty_report_names_the_gap() {
        let task = Task::new("t", "q", ResearchType::AnalyticalReport);
        let (markdown, sources) = empty_report(&task);
        assert!(markdown.contains("No sources found"));
        assert!(sources.is_empty());
    }
}
