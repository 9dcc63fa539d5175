//! Workflow data model
//!
//! A `Script` is the parsed form of a workflow file: forward steps (positional
//! members of a named sequence such as `hg_1`, `hg_2`) and auxiliary steps
//! (matched on demand through their `provides` patterns). A step is one or
//! the other, never both.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sl_core::{Error, Result};

use crate::pattern::Template;

/// Reference to a producing step inside `output_from`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    /// Relative position in the enclosing workflow; `-1` is the preceding step
    Relative(i32),
    /// Step by name
    Name(String),
}

/// Grouping scheme for the ordered input list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    /// Fixed chunk size; a smaller remainder group is kept at the tail
    Size(usize),
    /// One group per input
    Single,
    /// One group holding every input
    All,
    /// Consecutive overlapping pairs
    Pairwise,
    /// All two-element combinations
    Combinations,
    /// Expression evaluated with `_input` bound, yielding index groups
    Expr(String),
}

impl Serialize for GroupBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            GroupBy::Size(n) => serializer.serialize_u64(*n as u64),
            GroupBy::Single => serializer.serialize_str("single"),
            GroupBy::All => serializer.serialize_str("all"),
            GroupBy::Pairwise => serializer.serialize_str("pairwise"),
            GroupBy::Combinations => serializer.serialize_str("combinations"),
            GroupBy::Expr(e) => serializer.serialize_str(e),
        }
    }
}

impl<'de> Deserialize<'de> for GroupBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Size(usize),
            Spec(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Size(n) => GroupBy::Size(n),
            Repr::Spec(s) => match s.as_str() {
                "single" => GroupBy::Single,
                "all" => GroupBy::All,
                "pairwise" => GroupBy::Pairwise,
                "combinations" => GroupBy::Combinations,
                _ => GroupBy::Expr(s),
            },
        })
    }
}

/// One source term of an input clause; terms concatenate in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceTerm {
    /// Literal path templates
    Paths {
        paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    /// Glob pattern, re-evaluated on every run when the step starts
    Glob {
        glob: String,
        #[serde(default)]
        dynamic: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    /// Outputs of one or more referenced steps, optionally label-sliced
    OutputFrom {
        output_from: Vec<StepRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<GroupBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    /// A labelled output of whichever step declares it
    NamedOutput {
        named_output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<GroupBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

/// Side-sequence zipped element-wise onto inputs; the i-th value becomes the
/// `_var` attribute of the i-th input target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedWith {
    pub var: String,
    /// Inline values; when absent the variable is looked up in the step env
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
}

/// Like `paired_with` but one scalar per substep group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupWith {
    pub var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
}

/// One iteration axis of `for_each`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForEachAxis {
    /// Multi-key axis: each row binds every var at once
    Zipped {
        vars: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    /// Single variable over a sequence (inline or from the step env)
    Named {
        var: String,
        #[serde(default)]
        values: Option<Vec<serde_json::Value>>,
    },
}

/// The input clause of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputClause {
    #[serde(default)]
    pub terms: Vec<SourceTerm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupBy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paired_with: Vec<PairedWith>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_with: Vec<GroupWith>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub for_each: Vec<ForEachAxis>,
    /// Templates matched against input basenames to bind capture variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    /// When false, substeps of this step run one at a time
    #[serde(default = "default_true")]
    pub concurrent: bool,
}

impl Default for InputClause {
    fn default() -> Self {
        Self {
            terms: Vec::new(),
            group_by: None,
            paired_with: Vec::new(),
            group_with: Vec::new(),
            for_each: Vec::new(),
            patterns: Vec::new(),
            concurrent: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One declared output: an optional label and a path template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub path: String,
}

/// The output clause of a step
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutputClause {
    #[serde(default)]
    pub entries: Vec<OutputSpec>,
    /// Glob run after substep completion for outputs unknowable in advance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<String>,
}

impl OutputClause {
    pub fn labels(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| e.label.as_deref())
            .collect()
    }

    pub fn declares_label(&self, label: &str) -> bool {
        self.entries.iter().any(|e| e.label.as_deref() == Some(label))
    }
}

/// One entry of a `depends` directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependsSpec {
    /// A file that must exist or be producible
    File(String),
    /// Completion of every numbered instance of the named step
    Step(String),
    /// A shared variable made available upstream
    Variable(String),
    /// An executable on PATH
    Executable(String),
}

/// An action block inside a step body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Downgrade a failure of this action to a warning
    #[serde(default)]
    pub allow_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Shell command; `{expr}` placeholders expand against the substep env
    Shell { script: String },
    /// Statements executed through the expression bridge
    Eval { code: String },
    /// Abort the substep before outputs are realized when the condition holds
    StopIf { cond: String },
    /// Replace the group's input files with zap markers after success
    ZapInputs {},
}

impl Action {
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Shell {
                script: script.into(),
            },
            allow_error: false,
        }
    }

    pub fn stop_if(cond: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::StopIf { cond: cond.into() },
            allow_error: false,
        }
    }
}

/// A uniquely named unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Base name (`hg` for the forward instance `hg_2`)
    pub name: String,
    /// Numeric suffix ordering forward instances of the same base name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Auxiliary-rule patterns; non-empty marks the step auxiliary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    /// Names whose values propagate back to downstream environments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared: Vec<String>,
    #[serde(default)]
    pub input: InputClause,
    #[serde(default)]
    pub output: OutputClause,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<DependsSpec>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
            provides: Vec::new(),
            shared: Vec::new(),
            input: InputClause::default(),
            output: OutputClause::default(),
            depends: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn is_auxiliary(&self) -> bool {
        !self.provides.is_empty()
    }

    /// Full name shown in logs and reports (`hg_2` for numbered instances)
    pub fn display_name(&self) -> String {
        match self.index {
            Some(i) => format!("{}_{}", self.name, i),
            None => self.name.clone(),
        }
    }

    /// Match this step's provides patterns against a target name
    pub fn provides_match(
        &self,
        name: &str,
    ) -> Result<Option<std::collections::BTreeMap<String, String>>> {
        for pattern in &self.provides {
            let template = Template::parse(pattern)?;
            if let Some(bound) = template.matches(name) {
                return Ok(Some(bound));
            }
        }
        Ok(None)
    }
}

/// An ordered forward-step sequence selected from a script
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

/// A parsed workflow script: the full set of steps across all workflows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        let script = Self { steps };
        script.validate()?;
        Ok(script)
    }

    /// Deserialize a script from the parser collaborator's JSON form
    pub fn from_json(text: &str) -> Result<Self> {
        let script: Script = serde_json::from_str(text).map_err(|e| Error::Parse {
            message: e.to_string(),
        })?;
        script.validate()?;
        Ok(script)
    }

    /// Structural invariants checked before any action runs
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            let display = step.display_name();
            if !seen.insert(display.clone()) {
                return Err(Error::validation(
                    display.clone(),
                    "step name is not unique",
                ));
            }
            if step.is_auxiliary() && step.index.is_some() {
                return Err(Error::validation(
                    display,
                    "a step is either forward or auxiliary, never both",
                ));
            }
            for pattern in &step.provides {
                Template::parse(pattern)?;
            }
            for pattern in &step.input.patterns {
                Template::parse(pattern)?;
            }
        }
        Ok(())
    }

    /// Forward steps, in declaration order
    pub fn forward_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| !s.is_auxiliary())
    }

    /// Auxiliary steps, in declaration order
    pub fn auxiliary_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_auxiliary())
    }

    /// Every numbered instance of a forward base name, ordered by suffix
    pub fn instances_of(&self, base: &str) -> Vec<&Step> {
        let mut instances: Vec<&Step> =
            self.forward_steps().filter(|s| s.name == base).collect();
        instances.sort_by_key(|s| s.index.unwrap_or(0));
        instances
    }

    /// A step by its display name
    pub fn find_step(&self, display_name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.display_name() == display_name)
    }

    /// The step declaring a named output label, first in declaration order
    pub fn step_with_label(&self, label: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.output.declares_label(label))
    }

    /// Select a workflow by base name; with `None`, the single forward base
    /// name or the `default` sequence
    pub fn workflow(&self, name: Option<&str>) -> Result<Workflow> {
        let selected = match name {
            Some(name) => name.to_string(),
            None => {
                let mut bases: Vec<&str> = Vec::new();
                for step in self.forward_steps() {
                    if !bases.contains(&step.name.as_str()) {
                        bases.push(&step.name);
                    }
                }
                match bases.as_slice() {
                    [only] => only.to_string(),
                    _ if bases.contains(&"default") => "default".to_string(),
                    [] => {
                        return Err(Error::Parse {
                            message: "script has no forward steps".to_string(),
                        })
                    }
                    _ => {
                        return Err(Error::Parse {
                            message: format!(
                                "script defines workflows {:?}; select one",
                                bases
                            ),
                        })
                    }
                }
            }
        };

        let steps: Vec<Step> = self
            .instances_of(&selected)
            .into_iter()
            .cloned()
            .collect();
        if steps.is_empty() {
            return Err(Error::Parse {
                message: format!("no workflow named '{}'", selected),
            });
        }
        debug!(workflow = %selected, steps = steps.len(), "Selected workflow");
        Ok(Workflow {
            name: selected,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(base: &str, index: u32) -> Step {
        let mut s = Step::new(base);
        s.index = Some(index);
        s
    }

    #[test]
    fn test_workflow_selection_orders_by_suffix() {
        let script = Script::new(vec![
            numbered("hg", 2),
            numbered("hg", 1),
            Step::new("other"),
        ])
        .unwrap();

        let wf = script.workflow(Some("hg")).unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[0].display_name(), "hg_1");
        assert_eq!(wf.steps[1].display_name(), "hg_2");
    }

    #[test]
    fn test_workflow_selection_requires_name_when_ambiguous() {
        let script = Script::new(vec![Step::new("a"), Step::new("b")]).unwrap();
        assert!(script.workflow(None).is_err());
        assert!(script.workflow(Some("a")).is_ok());
    }

    #[test]
    fn test_default_workflow_preferred() {
        let script = Script::new(vec![Step::new("default"), Step::new("b")]).unwrap();
        assert_eq!(script.workflow(None).unwrap().name, "default");
    }

    #[test]
    fn test_forward_and_auxiliary_are_exclusive() {
        let mut aux = Step::new("make_a");
        aux.provides = vec!["a_{i}".to_string()];
        aux.index = Some(1);
        assert!(Script::new(vec![aux]).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        assert!(Script::new(vec![Step::new("x"), Step::new("x")]).is_err());
    }

    #[test]
    fn test_provides_match() {
        let mut aux = Step::new("make_a");
        aux.provides = vec!["a_{i}".to_string()];
        let bound = aux.provides_match("a_2").unwrap().unwrap();
        assert_eq!(bound.get("i").map(String::as_str), Some("2"));
        assert!(aux.provides_match("b_2").unwrap().is_none());
    }

    #[test]
    fn test_step_with_label() {
        let mut a = Step::new("A");
        a.output.entries.push(OutputSpec {
            label: Some("aa".to_string()),
            path: "a_{i}.txt".to_string(),
        });
        let script = Script::new(vec![a, Step::new("B")]).unwrap();
        assert_eq!(script.step_with_label("aa").unwrap().name, "A");
        assert!(script.step_with_label("zz").is_none());
    }

    #[test]
    fn test_script_json_roundtrip() {
        let json = r#"{
            "steps": [
                {
                    "name": "align",
                    "index": 1,
                    "input": {
                        "terms": [{"paths": ["a.txt", "b.txt"]}],
                        "group_by": "single",
                        "paired_with": [{"var": "vars", "values": [1, 2]}]
                    },
                    "output": {"entries": [{"path": "{_input}.out"}]},
                    "actions": [{"shell": {"script": "cp {_input} {_output}"}}]
                },
                {
                    "name": "make_ref",
                    "provides": ["ref_{build}.fa"],
                    "actions": [{"shell": {"script": "touch {_output}"}, "allow_error": true}]
                }
            ]
        }"#;

        let script = Script::from_json(json).unwrap();
        assert_eq!(script.steps.len(), 2);
        assert_eq!(script.steps[0].input.group_by, Some(GroupBy::Single));
        assert!(script.steps[1].is_auxiliary());
        assert!(script.steps[1].actions[0].allow_error);

        // group_by forms
        let gb: GroupBy = serde_json::from_str("2").unwrap();
        assert_eq!(gb, GroupBy::Size(2));
        let gb: GroupBy = serde_json::from_str("\"pairwise\"").unwrap();
        assert_eq!(gb, GroupBy::Pairwise);
        let gb: GroupBy = serde_json::from_str("\"chunks(_input, 3)\"").unwrap();
        assert!(matches!(gb, GroupBy::Expr(_)));
    }
}
