//! Target resolver
//!
//! Maps an unresolved target to its producer: an on-disk input leaf, an
//! auxiliary rule instantiated by `provides` match, a forward step reached by
//! name, or a failure. Auxiliary rules are scanned in declaration order and
//! the first match wins.

use tracing::{debug, instrument};

use sl_core::{Error, Result};
use sl_target::{Resolution, Target};
use sl_workflow::Script;

use crate::Node;

/// How a target is produced
#[derive(Debug)]
pub enum Production {
    /// Present on disk with no producing rule: an input leaf
    Leaf,
    /// Producer nodes to insert (or reuse), each edged to the consumer
    Nodes(Vec<Node>),
}

pub struct Resolver<'a> {
    script: &'a Script,
}

impl<'a> Resolver<'a> {
    pub fn new(script: &'a Script) -> Self {
        Self { script }
    }

    #[instrument(skip(self), fields(target = %target))]
    pub fn resolve(&self, target: &Target) -> Result<Production> {
        match target {
            Target::File { path } => {
                // a rule claiming the name takes precedence over a stale file
                if let Some(node) = self.match_auxiliary(target)? {
                    debug!(node = %node.id, "Auxiliary rule claims target");
                    return Ok(Production::Nodes(vec![node]));
                }
                match target.resolution() {
                    Resolution::Resolved | Resolution::Zapped => Ok(Production::Leaf),
                    Resolution::Missing => match self.match_forward_output(target)? {
                        Some(node) => {
                            debug!(node = %node.id, "Forward step output claims target");
                            Ok(Production::Nodes(vec![node]))
                        }
                        None => Err(Error::unknown_target(path.display())),
                    },
                }
            }
            Target::StepCompletion { step } => {
                let instances = self.script.instances_of(step);
                if instances.is_empty() {
                    return Err(Error::unknown_target(target));
                }
                Ok(Production::Nodes(
                    instances
                        .into_iter()
                        .map(|s| Node::forward(s.clone()))
                        .collect(),
                ))
            }
            Target::NamedOutput { label } => match self.script.step_with_label(label) {
                Some(step) if !step.is_auxiliary() => {
                    Ok(Production::Nodes(vec![Node::forward(step.clone())]))
                }
                _ => Err(Error::unknown_target(target)),
            },
            Target::Variable { name } => {
                let producer = self
                    .script
                    .forward_steps()
                    .find(|s| s.shared.iter().any(|v| v == name));
                match producer {
                    Some(step) => Ok(Production::Nodes(vec![Node::forward(step.clone())])),
                    None => Err(Error::unknown_target(target)),
                }
            }
            Target::Executable { .. } => match target.resolution() {
                Resolution::Resolved => Ok(Production::Leaf),
                _ => Err(Error::unknown_target(target)),
            },
        }
    }

    /// First forward step whose output template matches the target name
    fn match_forward_output(&self, target: &Target) -> Result<Option<Node>> {
        let Some(basename) = target.basename() else {
            return Ok(None);
        };
        for step in self.script.forward_steps() {
            for spec in &step.output.entries {
                let Ok(template) = sl_workflow::Template::parse(&spec.path) else {
                    continue;
                };
                if template.matches(&basename).is_some() {
                    return Ok(Some(Node::forward(step.clone())));
                }
            }
        }
        Ok(None)
    }

    /// First auxiliary rule whose `provides` pattern matches the target name
    fn match_auxiliary(&self, target: &Target) -> Result<Option<Node>> {
        let Some(basename) = target.basename() else {
            return Ok(None);
        };
        let full = target
            .path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        for step in self.script.auxiliary_steps() {
            for candidate in [basename.as_str(), full.as_str()] {
                if let Some(bound) = step.provides_match(candidate)? {
                    // the node is instantiated for the full path so its
                    // output lands where the consumer looks for it
                    return Ok(Some(Node::auxiliary(step.clone(), &full, bound)));
                }
            }
        }
        Ok(None)
    }
}
