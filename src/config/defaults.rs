use crate::orchestration::types::WorkerConfig;

/// Built-in worker templates, used when no configuration layer lists any.
pub fn default_templates() -> Vec<WorkerConfig> {
    let all_tools = || {
        vec![
            "read_file".to_string(),
            "write_file".to_string(),
            "search_files".to_string(),
        ]
    };

    vec![
        WorkerConfig {
            name: "general".into(),
            description: "A general-purpose worker that can handle various tasks.".into(),
            system_prompt: "You are a helpful worker agent. Complete tasks thoroughly and clearly."
                .into(),
            tools: all_tools(),
        },
        WorkerConfig {
            name: "coder".into(),
            description: "A coding specialist for writing and modifying code.".into(),
            system_prompt:
                "You are a coding agent. Write clean, well-structured code with good error handling."
                    .into(),
            tools: all_tools(),
        },
        WorkerConfig {
            name: "researcher".into(),
            description: "A research agent for gathering and analyzing information.".into(),
            system_prompt:
                "You are a research agent. Gather information thoroughly and provide clear summaries."
                    .into(),
            tools: vec!["read_file".to_string(), "search_files".to_string()],
        },
    ]
}
