/// Parameters that never contribute to a generated experiment name.
const SKIPPED_PARAMETERS: [&str; 2] = ["experiment_name", "reuse.path"];

/// `optimization.learning_rate` -> `ople`: first two characters of every
/// dotted component after dropping underscores.
pub fn shorten_parameter_name(name: &str) -> String {
    name.replace('_', "")
        .split('.')
        .map(|part| part.chars().take(2).collect::<String>())
        .collect()
}

/// Joins `basename` and the parameter values of a sweep into a directory
/// friendly experiment name.
pub fn build_experiment_name(
    parameters: &[(String, String)],
    include_param_shorthand: bool,
    basename: &str,
) -> String {
    let mut parts = Vec::new();
    if !basename.is_empty() {
        parts.push(basename.to_string());
    }
    for (name, value) in parameters {
        if SKIPPED_PARAMETERS.contains(&name.as_str()) {
            continue;
        }
        if include_param_shorthand {
            parts.push(format!("{}-{}", shorten_parameter_name(name), value));
        } else {
            parts.push(value.clone());
        }
    }
    parts.join("_")
}
