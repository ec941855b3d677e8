use super::document::WorkflowDocument;
use std::collections::{HashMap, HashSet};

/// Validate a workflow document before execution.
///
/// Pure: the same document always yields the same issues in the same
/// order. An empty vector means the document may execute.
pub fn validate(doc: &WorkflowDocument) -> Vec<String> {
    let mut issues = Vec::new();

    if doc.name.trim().is_empty() {
        issues.push("Workflow name is required".to_string());
    }
    if doc.tasks.is_empty() {
        issues.push("Workflow has no tasks".to_string());
    }

    let mut seen = HashSet::new();
    for task in &doc.tasks {
        if task.id.trim().is_empty() {
            issues.push("Task with empty ID".to_string());
            continue;
        }
        if !seen.insert(task.id.clone()) {
            issues.push(format!("Duplicate task ID: {}", task.id));
        }
        if task.task_type.trim().is_empty() {
            issues.push(format!("Task {}: type is required", task.id));
        }
        if task.description.trim().is_empty() {
            issues.push(format!("Task {}: description is required", task.id));
        }
    }

    let known: HashSet<&str> = doc.tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &doc.tasks {
        for dep in &task.depends {
            if !known.contains(dep.as_str()) {
                issues.push(format!("Task {}: unknown dependency: {dep}", task.id));
            }
        }
    }

    if has_cycle(doc) {
        issues.push("Circular dependencies detected".to_string());
    }

    let declared: HashSet<&str> = doc.agents.iter().map(|a| a.id.as_str()).collect();
    for task in &doc.tasks {
        if let Some(assignee) = &task.assign_to {
            if !declared.contains(assignee.as_str()) {
                issues.push(format!("Task {}: unknown agent: {assignee}", task.id));
            }
        }
    }

    issues
}

/// DFS over the dependency graph with an explicit recursion set.
fn has_cycle(doc: &WorkflowDocument) -> bool {
    let edges: HashMap<&str, &[String]> = doc
        .tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends.as_slice()))
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    let mut in_stack: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, &'a [String]>,
        done: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !in_stack.insert(node) {
            return true;
        }
        if let Some(deps) = edges.get(node) {
            for dep in deps.iter() {
                if edges.contains_key(dep.as_str())
                    && visit(dep.as_str(), edges, done, in_stack)
                {
                    return true;
                }
            }
        }
        in_stack.remove(node);
        done.insert(node);
        false
    }

    doc.tasks
        .iter()
        .any(|t| visit(t.id.as_str(), &edges, &mut done, &mut in_stack))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(raw: &str) -> WorkflowDocument {
        WorkflowDocument::from_json(raw).unwrap()
    }

    #[test]
    fn valid_diamond_passes() {
        let issues = validate(&doc(r#"{
            "name": "diamond",
            "tasks": [
                {"id": "a", "type": "t", "description": "d"},
                {"id": "b", "type": "t", "description": "d", "depends": ["a"]},
                {"id": "c", "type": "t", "description": "d", "depends": ["a"]},
                {"id": "d", "type": "t", "description": "d", "depends": ["b", "c"]}
            ]
        }"#));
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn duplicate_task_id_is_reported() {
        let issues = validate(&doc(r#"{
            "name": "dupes",
            "tasks": [
                {"id": "a", "type": "t", "description": "d"},
                {"id": "b", "type": "t", "description": "d"},
                {"id": "a", "type": "t", "description": "d"}
            ]
        }"#));
        assert!(issues.contains(&"Duplicate task ID: a".to_string()));
    }

    #[test]
    fn two_node_cycle_is_reported() {
        let issues = validate(&doc(r#"{
            "name": "cycle",
            "tasks": [
                {"id": "a", "type": "t", "description": "d", "depends": ["b"]},
                {"id": "b", "type": "t", "description": "d", "depends": ["a"]}
            ]
        }"#));
        assert!(issues.contains(&"Circular dependencies detected".to_string()));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let issues = validate(&doc(r#"{
            "name": "self",
            "tasks": [{"id": "a", "type": "t", "description": "d", "depends": ["a"]}]
        }"#));
        assert!(issues.contains(&"Circular dependencies detected".to_string()));
    }

    #[test]
    fn unknown_dependency_and_agent_are_reported() {
        let issues = validate(&doc(r#"{
            "name": "refs",
            "agents": [{"id": "builder", "type": "coder"}],
            "tasks": [
                {"id": "a", "type": "t", "description": "d", "depends": ["ghost"]},
                {"id": "b", "type": "t", "description": "d", "assignTo": "phantom"}
            ]
        }"#));
        assert!(issues.contains(&"Task a: unknown dependency: ghost".to_string()));
        assert!(issues.contains(&"Task b: unknown agent: phantom".to_string()));
    }

    #[test]
    fn missing_name_type_description_are_reported() {
        let issues = validate(&doc(r#"{"name": "", "tasks": [{"id": "a"}]}"#));
        assert_eq!(issues[0], "Workflow name is required");
        assert!(issues.contains(&"Task a: type is required".to_string()));
        assert!(issues.contains(&"Task a: description is required".to_string()));
    }

    #[test]
    fn validation_is_stable() {
        let raw = r#"{
            "name": "",
            "tasks": [
                {"id": "a", "depends": ["x"]},
                {"id": "a", "type": "t", "description": "d"}
            ]
        }"#;
        let first = validate(&doc(raw));
        let second = validate(&doc(raw));
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
