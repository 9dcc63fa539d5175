//! Substep expander
//!
//! Turns a step's assembled input list plus its grouping, pairing and
//! iteration options into an ordered list of substep groups. Expansion is a
//! pure function of the step text, the input targets and the bound
//! environment: identical invocations produce identical group lists.

use serde_json::Value;
use tracing::{debug, instrument};

use sl_core::{Error, Result};
use sl_target::TargetEntry;
use sl_workflow::{ForEachAxis, GroupBy, Step, Template};

use crate::eval::{Env, Evaluator};

/// Inputs contributed by one source term, with the term's own grouping
#[derive(Debug, Clone)]
pub struct TermInputs {
    pub entries: Vec<TargetEntry>,
    pub group_by: Option<GroupBy>,
}

impl TermInputs {
    pub fn plain(entries: Vec<TargetEntry>) -> Self {
        Self {
            entries,
            group_by: None,
        }
    }
}

/// One execution unit of a step
#[derive(Debug, Clone)]
pub struct SubstepGroup {
    pub index: usize,
    pub inputs: Vec<TargetEntry>,
    pub bound: Env,
}

/// Expand a step's inputs into substep groups.
///
/// Groups are enumerated with the base groupings as the inner loop and
/// `for_each` axes as outer loops, axes in declaration order; `_index` is the
/// dense enumeration position.
#[instrument(skip_all, fields(step = %step.display_name()))]
pub fn expand_step(
    step: &Step,
    terms: Vec<TermInputs>,
    env: &Env,
    evaluator: &dyn Evaluator,
) -> Result<Vec<SubstepGroup>> {
    let step_name = step.display_name();
    let clause = &step.input;

    // source terms concatenate in order
    let mut flat: Vec<TargetEntry> = Vec::new();
    let mut term_ranges: Vec<(usize, usize, Option<GroupBy>)> = Vec::new();
    for term in terms {
        let start = flat.len();
        flat.extend(term.entries);
        term_ranges.push((start, flat.len(), term.group_by));
    }

    // paired_with: one attribute per input target
    let mut paired: Vec<(String, Vec<Value>)> = Vec::new();
    for pw in &clause.paired_with {
        let values = side_sequence(&step_name, &pw.var, pw.values.as_ref(), env)?;
        if values.len() != flat.len() {
            return Err(Error::validation(
                step_name.clone(),
                format!(
                    "paired_with '{}' has {} values for {} inputs",
                    pw.var,
                    values.len(),
                    flat.len()
                ),
            ));
        }
        let attr = format!("_{}", pw.var);
        for (entry, value) in flat.iter_mut().zip(values.iter()) {
            entry.set_attr(attr.clone(), value.clone());
        }
        paired.push((attr, values));
    }

    // base grouping: the clause's scheme, else per-term schemes, else one
    // group of everything (and exactly one empty group for empty inputs)
    let base_groups: Vec<Vec<usize>> = if let Some(scheme) = &clause.group_by {
        apply_group_by(&step_name, scheme, 0, flat.len(), &flat, env, evaluator)?
    } else if term_ranges.iter().any(|(_, _, gb)| gb.is_some()) {
        let mut groups = Vec::new();
        for (start, end, scheme) in &term_ranges {
            match scheme {
                Some(scheme) => groups.extend(apply_group_by(
                    &step_name,
                    scheme,
                    *start,
                    end - start,
                    &flat,
                    env,
                    evaluator,
                )?),
                None if end > start => groups.push((*start..*end).collect()),
                None => {}
            }
        }
        groups
    } else {
        vec![(0..flat.len()).collect()]
    };

    // group_with: one scalar per base group
    let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
    for gw in &clause.group_with {
        let values = side_sequence(&step_name, &gw.var, gw.values.as_ref(), env)?;
        if values.len() != base_groups.len() {
            return Err(Error::validation(
                step_name.clone(),
                format!(
                    "group_with '{}' has {} values for {} groups",
                    gw.var,
                    values.len(),
                    base_groups.len()
                ),
            ));
        }
        grouped.push((format!("_{}", gw.var), values));
    }

    // patterns bind capture variables from input basenames
    let templates: Vec<Template> = clause
        .patterns
        .iter()
        .map(|p| Template::parse(p))
        .collect::<Result<_>>()?;

    // for_each axes, first-declared outermost
    let axes = resolve_axes(&step_name, &clause.for_each, env)?;
    let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
    for axis in &axes {
        let mut next = Vec::with_capacity(combos.len() * axis.rows.len());
        for combo in &combos {
            for row in &axis.rows {
                let mut extended = combo.clone();
                for (var, value) in axis.vars.iter().zip(row.iter()) {
                    extended.push((var.clone(), value.clone()));
                }
                next.push(extended);
            }
        }
        combos = next;
    }

    let mut groups = Vec::with_capacity(combos.len() * base_groups.len());
    for combo in &combos {
        for (base_index, member_indices) in base_groups.iter().enumerate() {
            let index = groups.len();
            let mut inputs: Vec<TargetEntry> =
                member_indices.iter().map(|&i| flat[i].clone()).collect();
            let mut bound = Env::new();

            for (var, value) in combo {
                bound.insert(var.clone(), value.clone());
            }
            for (attr, values) in &paired {
                let in_group: Vec<Value> =
                    member_indices.iter().map(|&i| values[i].clone()).collect();
                bound.insert(attr.clone(), Value::Array(in_group));
            }
            for (attr, values) in &grouped {
                let value = values[base_index].clone();
                for entry in &mut inputs {
                    entry.set_attr(attr.clone(), value.clone());
                }
                bound.insert(attr.clone(), value);
            }
            bind_pattern_captures(&templates, &inputs, &mut bound);
            bound.insert("_index".to_string(), Value::Number((index as i64).into()));

            groups.push(SubstepGroup {
                index,
                inputs,
                bound,
            });
        }
    }

    debug!(groups = groups.len(), inputs = flat.len(), "Expanded step");
    Ok(groups)
}

/// First matching template per input; a group with no matching input leaves
/// its capture variables unset
fn bind_pattern_captures(templates: &[Template], inputs: &[TargetEntry], bound: &mut Env) {
    if templates.is_empty() {
        return;
    }
    let mut names: Vec<&str> = Vec::new();
    for t in templates {
        for name in t.placeholders() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    let mut captures: Vec<Vec<Value>> = vec![Vec::new(); names.len()];
    let mut any_match = false;
    for entry in inputs {
        let matched = entry
            .target
            .basename()
            .and_then(|base| templates.iter().find_map(|t| t.matches(&base)));
        match matched {
            Some(bound_vars) => {
                any_match = true;
                for (slot, name) in names.iter().enumerate() {
                    captures[slot].push(
                        bound_vars
                            .get(*name)
                            .map(|v| Value::String(v.clone()))
                            .unwrap_or(Value::Null),
                    );
                }
            }
            None => {
                for slot in captures.iter_mut() {
                    slot.push(Value::Null);
                }
            }
        }
    }

    if any_match {
        for (slot, name) in names.iter().enumerate() {
            bound.insert(name.to_string(), Value::Array(captures[slot].clone()));
        }
    }
}

struct ResolvedAxis {
    vars: Vec<String>,
    rows: Vec<Vec<Value>>,
}

fn resolve_axes(step: &str, axes: &[ForEachAxis], env: &Env) -> Result<Vec<ResolvedAxis>> {
    let mut resolved = Vec::with_capacity(axes.len());
    for axis in axes {
        match axis {
            ForEachAxis::Named { var, values } => {
                let values = side_sequence(step, var, values.as_ref(), env)?;
                resolved.push(ResolvedAxis {
                    vars: vec![var.clone()],
                    rows: values.into_iter().map(|v| vec![v]).collect(),
                });
            }
            ForEachAxis::Zipped { vars, rows } => {
                for row in rows {
                    if row.len() != vars.len() {
                        return Err(Error::validation(
                            step,
                            format!(
                                "for_each row has {} values for keys {:?}",
                                row.len(),
                                vars
                            ),
                        ));
                    }
                }
                resolved.push(ResolvedAxis {
                    vars: vars.clone(),
                    rows: rows.clone(),
                });
            }
        }
    }
    Ok(resolved)
}

/// Inline values, or a sequence looked up in the step environment
fn side_sequence(
    step: &str,
    var: &str,
    inline: Option<&Vec<Value>>,
    env: &Env,
) -> Result<Vec<Value>> {
    if let Some(values) = inline {
        return Ok(values.clone());
    }
    match env.get(var) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Ok(vec![other.clone()]),
        None => Err(Error::validation(
            step,
            format!("no sequence named '{}' in scope", var),
        )),
    }
}

fn apply_group_by(
    step: &str,
    scheme: &GroupBy,
    offset: usize,
    count: usize,
    flat: &[TargetEntry],
    env: &Env,
    evaluator: &dyn Evaluator,
) -> Result<Vec<Vec<usize>>> {
    if count == 0 {
        // an explicit grouping over no inputs is a legal noop
        return Ok(Vec::new());
    }
    let indices: Vec<usize> = (offset..offset + count).collect();
    let groups = match scheme {
        GroupBy::Size(0) => {
            return Err(Error::validation(step, "group_by size must be positive"))
        }
        GroupBy::Size(k) => indices.chunks(*k).map(|c| c.to_vec()).collect(),
        GroupBy::Single => indices.chunks(1).map(|c| c.to_vec()).collect(),
        GroupBy::All => vec![indices],
        GroupBy::Pairwise => indices.windows(2).map(|w| w.to_vec()).collect(),
        GroupBy::Combinations => {
            let mut pairs = Vec::new();
            for i in 0..indices.len() {
                for j in i + 1..indices.len() {
                    pairs.push(vec![indices[i], indices[j]]);
                }
            }
            pairs
        }
        GroupBy::Expr(expr) => {
            let paths: Vec<Value> = indices
                .iter()
                .map(|&i| Value::String(flat[i].target.to_string()))
                .collect();
            let mut scoped = env.clone();
            scoped.insert("_input".to_string(), Value::Array(paths));
            let value = evaluator.eval(expr, &scoped)?;
            let Value::Array(outer) = value else {
                return Err(Error::validation(
                    step,
                    format!("group_by expression '{}' did not yield groups", expr),
                ));
            };
            let mut groups = Vec::with_capacity(outer.len());
            for item in outer {
                let Value::Array(inner) = item else {
                    return Err(Error::validation(
                        step,
                        "group_by expression must yield a sequence of index groups",
                    ));
                };
                let mut group = Vec::with_capacity(inner.len());
                for idx in inner {
                    let i = idx.as_i64().filter(|&i| 0 <= i && (i as usize) < count);
                    match i {
                        Some(i) => group.push(offset + i as usize),
                        None => {
                            return Err(Error::validation(
                                step,
                                format!("group_by index {} out of range", idx),
                            ))
                        }
                    }
                }
                groups.push(group);
            }
            groups
        }
    };
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::SimpleEvaluator;
    use serde_json::{json, Value};
    use sl_target::Target;
    use sl_workflow::{GroupWith, InputClause, PairedWith};

    fn entries(names: &[&str]) -> Vec<TargetEntry> {
        names
            .iter()
            .map(|n| TargetEntry::new(Target::file(n)))
            .collect()
    }

    fn step_with(input: InputClause) -> Step {
        let mut step = Step::new("s");
        step.input = input;
        step
    }

    fn expand(step: &Step, inputs: Vec<TargetEntry>) -> Result<Vec<SubstepGroup>> {
        expand_step(
            step,
            vec![TermInputs::plain(inputs)],
            &Env::new(),
            &SimpleEvaluator::new(),
        )
    }

    #[test]
    fn test_default_is_one_group_of_everything() {
        let step = step_with(InputClause::default());
        let groups = expand(&step, entries(&["a.txt", "b.txt"])).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].inputs.len(), 2);
        assert_eq!(groups[0].bound.get("_index"), Some(&json!(0)));
    }

    #[test]
    fn test_empty_inputs_without_group_by_runs_once() {
        let step = step_with(InputClause::default());
        let groups = expand(&step, entries(&[])).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].inputs.is_empty());
    }

    #[test]
    fn test_empty_inputs_with_group_by_is_noop() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Single),
            ..Default::default()
        });
        let groups = expand(&step, entries(&[])).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_chunking_keeps_remainder() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Size(2)),
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a", "b", "c", "d", "e"])).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].inputs.len(), 1);
    }

    #[test]
    fn test_pairwise_and_combinations() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Pairwise),
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a", "b", "c"])).unwrap();
        assert_eq!(groups.len(), 2);

        let step = step_with(InputClause {
            group_by: Some(GroupBy::Combinations),
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a", "b", "c"])).unwrap();
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_group_by_expression() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Expr("[[0, 2], [1]]".to_string())),
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a", "b", "c"])).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].inputs.len(), 2);
        assert_eq!(groups[1].inputs.len(), 1);
    }

    #[test]
    fn test_single_with_paired_values() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Size(1)),
            paired_with: vec![PairedWith {
                var: "vars".to_string(),
                values: Some(vec![json!(1), json!(2)]),
            }],
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a.txt", "b.txt"])).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].inputs[0].attr("_vars"), Some(&json!(1)));
        assert_eq!(groups[1].inputs[0].attr("_vars"), Some(&json!(2)));
        assert_eq!(groups[0].bound.get("_vars"), Some(&json!([1])));
        assert_eq!(groups[1].bound.get("_vars"), Some(&json!([2])));
    }

    #[test]
    fn test_paired_length_mismatch_rejected() {
        let step = step_with(InputClause {
            paired_with: vec![PairedWith {
                var: "vars".to_string(),
                values: Some(vec![json!(1)]),
            }],
            ..Default::default()
        });
        let err = expand(&step, entries(&["a", "b"])).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_group_with_binds_one_scalar_per_group() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Size(2)),
            group_with: vec![GroupWith {
                var: "batch".to_string(),
                values: Some(vec![json!("x"), json!("y")]),
            }],
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a", "b", "c", "d"])).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].bound.get("_batch"), Some(&json!("x")));
        assert_eq!(groups[1].bound.get("_batch"), Some(&json!("y")));
        assert_eq!(groups[1].inputs[0].attr("_batch"), Some(&json!("y")));

        let step = step_with(InputClause {
            group_by: Some(GroupBy::Size(2)),
            group_with: vec![GroupWith {
                var: "batch".to_string(),
                values: Some(vec![json!("x")]),
            }],
            ..Default::default()
        });
        assert!(expand(&step, entries(&["a", "b", "c", "d"])).is_err());
    }

    #[test]
    fn test_for_each_outer_product_ordering() {
        // 3 single groups, paired names a b c, for_each c over two values:
        // base groups cycle fastest, so _names reads "a b c a b c" and _c
        // reads "1 1 1 2 2 2" across the six groups
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Single),
            paired_with: vec![PairedWith {
                var: "names".to_string(),
                values: Some(vec![json!("a"), json!("b"), json!("c")]),
            }],
            for_each: vec![ForEachAxis::Named {
                var: "c".to_string(),
                values: Some(vec![json!("1"), json!("2")]),
            }],
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a.pdf", "a.txt", "b.txt"])).unwrap();
        assert_eq!(groups.len(), 6);

        let names: Vec<String> = groups
            .iter()
            .map(|g| match g.bound.get("_names") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(crate::eval::render_value)
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => panic!("missing _names"),
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "a", "b", "c"]);

        let cs: Vec<&Value> = groups.iter().map(|g| &g.bound["c"]).collect();
        assert_eq!(
            cs,
            vec![
                &json!("1"),
                &json!("1"),
                &json!("1"),
                &json!("2"),
                &json!("2"),
                &json!("2")
            ]
        );

        let indices: Vec<usize> = groups.iter().map(|g| g.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_for_each_zipped_axis() {
        let step = step_with(InputClause {
            for_each: vec![ForEachAxis::Zipped {
                vars: vec!["sample".to_string(), "lane".to_string()],
                rows: vec![
                    vec![json!("s1"), json!(1)],
                    vec![json!("s2"), json!(2)],
                ],
            }],
            ..Default::default()
        });
        let groups = expand(&step, entries(&["a.txt"])).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].bound.get("sample"), Some(&json!("s1")));
        assert_eq!(groups[1].bound.get("lane"), Some(&json!(2)));
    }

    #[test]
    fn test_for_each_from_environment() {
        let step = step_with(InputClause {
            for_each: vec![ForEachAxis::Named {
                var: "i".to_string(),
                values: None,
            }],
            ..Default::default()
        });
        let mut env = Env::new();
        env.insert("i".to_string(), json!([0, 1, 2]));
        let groups = expand_step(
            &step,
            vec![TermInputs::plain(vec![])],
            &env,
            &SimpleEvaluator::new(),
        )
        .unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].bound.get("i"), Some(&json!(2)));
    }

    #[test]
    fn test_pattern_captures() {
        let step = step_with(InputClause {
            group_by: Some(GroupBy::Single),
            patterns: vec!["{sample}_{lane}.fastq".to_string()],
            ..Default::default()
        });
        let groups = expand(&step, entries(&["s1_L001.fastq", "odd-name.bin"])).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].bound.get("sample"), Some(&json!(["s1"])));
        // non-matching group leaves captures unset
        assert!(!groups[1].bound.contains_key("sample"));
    }

    #[test]
    fn test_per_term_grouping_concatenates() {
        let step = step_with(InputClause::default());
        let groups = expand_step(
            &step,
            vec![
                TermInputs {
                    entries: entries(&["g0", "g1", "g2", "g3"]),
                    group_by: Some(GroupBy::Size(2)),
                },
                TermInputs {
                    entries: entries(&["a0", "a1"]),
                    group_by: Some(GroupBy::Size(2)),
                },
            ],
            &Env::new(),
            &SimpleEvaluator::new(),
        )
        .unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].inputs.len(), 2);
        assert_eq!(groups[2].inputs.len(), 2);
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let make = || {
            let step = step_with(InputClause {
                group_by: Some(GroupBy::Size(2)),
                for_each: vec![ForEachAxis::Named {
                    var: "k".to_string(),
                    values: Some(vec![json!("x"), json!("y")]),
                }],
                ..Default::default()
            });
            expand(&step, entries(&["a", "b", "c"])).unwrap()
        };
        let first = make();
        let second = make();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.bound, b.bound);
            assert_eq!(
                a.inputs.iter().map(|e| &e.target).collect::<Vec<_>>(),
                b.inputs.iter().map(|e| &e.target).collect::<Vec<_>>()
            );
        }
    }
}
