//! Path resolution over a StructureDefinition's element tree
//!
//! Resolves dotted FSH paths (e.g. `name.given`, `identifier[mrn].system`,
//! `value[x]`) to positions in the snapshot element sequence. Resolution is
//! purely in-tree: a segment naming a field with no corresponding element
//! fails the lookup, which the rule dispatcher treats as a per-rule,
//! non-fatal condition.
//!
//! # Algorithm
//!
//! 1. Parse the path into segments with bracket information
//! 2. Walk left to right, locating the child element for each segment
//! 3. A slice-name bracket materializes (or reuses) the sliced node
//! 4. A numeric index on an unsliced element is a plain repetition marker
//!    and resolves to the same node
//! 5. Children addressed through a slice are materialized from the base
//!    element's children on first use
//!
//! The algorithm is idempotent: re-resolving the same literal path returns
//! the same node and materializes nothing new.

use crate::export::fhir_types::{
    ElementDefinition, ElementDefinitionSlicing, StructureDefinition,
};
use thiserror::Error;
use tracing::trace;

/// Path segment with bracket information
///
/// In `contact[0].telecom[home].system` there are three segments:
/// `contact` with bracket `[0]`, `telecom` with bracket `[home]`, and
/// `system` with no bracket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Base element name (before any bracket)
    pub base: String,
    /// Bracket groups, in order of appearance
    pub brackets: Vec<Bracket>,
}

/// Bracket types in FSH paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bracket {
    /// Slice name: `[sliceName]`
    Slice(String),
    /// Array index: `[0]`, `[1]`: a repetition marker on the element tree
    Index(usize),
    /// Choice type marker: `[x]`
    ChoiceType,
}

/// Path resolution errors
#[derive(Debug, Error)]
pub enum PathError {
    #[error("Cannot resolve path: {path} in {type_name}")]
    NotFound { path: String, type_name: String },

    #[error("Invalid path syntax: {0}")]
    InvalidSyntax(String),

    #[error("Structure has no snapshot elements")]
    EmptyTree,
}

/// Parse an FSH path into segments
pub fn parse_fsh_path(path: &str) -> Result<Vec<PathSegment>, PathError> {
    let mut segments = Vec::new();
    let mut base = String::new();
    let mut brackets = Vec::new();
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if base.is_empty() {
                    return Err(PathError::InvalidSyntax(format!(
                        "empty segment in path '{path}'"
                    )));
                }
                segments.push(PathSegment {
                    base: std::mem::take(&mut base),
                    brackets: std::mem::take(&mut brackets),
                });
            }
            '[' => {
                let mut content = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    content.push(inner);
                }
                if !closed {
                    return Err(PathError::InvalidSyntax(format!(
                        "unclosed bracket in path '{path}'"
                    )));
                }
                brackets.push(classify_bracket(&content));
            }
            ']' => {
                return Err(PathError::InvalidSyntax(format!(
                    "unmatched ']' in path '{path}'"
                )));
            }
            _ => base.push(ch),
        }
    }

    if base.is_empty() && brackets.is_empty() && segments.is_empty() {
        return Err(PathError::InvalidSyntax("empty path".to_string()));
    }
    if base.is_empty() {
        return Err(PathError::InvalidSyntax(format!(
            "trailing '.' in path '{path}'"
        )));
    }
    segments.push(PathSegment { base, brackets });
    Ok(segments)
}

fn classify_bracket(content: &str) -> Bracket {
    if content == "x" {
        Bracket::ChoiceType
    } else if !content.is_empty() && content.chars().all(|c| c.is_ascii_digit()) {
        Bracket::Index(content.parse().unwrap_or(0))
    } else {
        Bracket::Slice(content.to_string())
    }
}

/// Resolve a path to the position of its element in the snapshot sequence,
/// materializing sliced nodes as needed.
///
/// An empty path resolves to the root element.
pub fn resolve_element(sd: &mut StructureDefinition, path: &str) -> Result<usize, PathError> {
    if sd.elements().is_empty() {
        return Err(PathError::EmptyTree);
    }
    if path.is_empty() || path == "." {
        return Ok(0);
    }

    let type_name = sd.root_path().unwrap_or(&sd.name).to_string();
    let segments = parse_fsh_path(path)?;

    // Track the current node by id: materializing nodes shifts indices.
    let mut current_id = sd.elements()[0].id_or_path().to_string();
    let mut current_path = type_name.clone();

    for segment in &segments {
        let mut field = segment.base.clone();
        for bracket in &segment.brackets {
            if *bracket == Bracket::ChoiceType {
                field.push_str("[x]");
            }
        }

        let child_path = format!("{current_path}.{field}");
        let child_id = format!("{current_id}.{field}");

        if find_by_id(sd, &child_id).is_none() {
            // Inside a slice the child may not exist yet; materialize it
            // from the base element's child of the same name.
            if current_id != current_path && find_by_id(sd, &child_path).is_some() {
                materialize_slice_child(sd, &child_path, &current_id, &child_id);
                trace!("Materialized slice child {}", child_id);
            } else {
                return Err(PathError::NotFound {
                    path: path.to_string(),
                    type_name,
                });
            }
        }

        current_id = child_id;
        current_path = child_path;

        for bracket in &segment.brackets {
            match bracket {
                // Part of the field name, handled above
                Bracket::ChoiceType => {}
                // A plain repetition marker: element definitions describe the
                // type of all repetitions uniformly, so no new node is needed.
                Bracket::Index(_) => {}
                Bracket::Slice(name) => {
                    let slice_id = format!("{current_id}:{name}");
                    if find_by_id(sd, &slice_id).is_none() {
                        materialize_slice(sd, &current_id, name);
                        trace!("Materialized slice {}", slice_id);
                    }
                    current_id = slice_id;
                }
            }
        }
    }

    find_by_id(sd, &current_id).ok_or(PathError::NotFound {
        path: path.to_string(),
        type_name,
    })
}

/// Position of the element with the given id
pub fn find_by_id(sd: &StructureDefinition, id: &str) -> Option<usize> {
    sd.elements().iter().position(|e| e.id_or_path() == id)
}

/// The default slicing descriptor installed when a slice is materialized on
/// an element that has none yet; caret rules may refine it.
fn default_slicing() -> ElementDefinitionSlicing {
    ElementDefinitionSlicing {
        discriminator: None,
        description: Some("Unordered, Open".to_string()),
        ordered: Some(false),
        rules: "open".to_string(),
    }
}

/// Create a new slice node under the element with id `base_id`, returning
/// its position. The node inherits type and base information from the base
/// element and starts at 0..max.
pub fn materialize_slice(sd: &mut StructureDefinition, base_id: &str, slice_name: &str) -> usize {
    let base_idx = find_by_id(sd, base_id).expect("slice base must exist");
    let insert_at = end_of_subtree(sd, base_idx, base_id);

    let (path, max, type_, base) = {
        let base_elem = &sd.elements()[base_idx];
        (
            base_elem.path.clone(),
            base_elem.max.clone(),
            base_elem.type_.clone(),
            base_elem.base.clone(),
        )
    };

    {
        let elements = sd.elements_mut();
        if elements[base_idx].slicing.is_none() {
            elements[base_idx].slicing = Some(default_slicing());
        }

        let mut slice = ElementDefinition::new(path);
        slice.id = Some(format!("{base_id}:{slice_name}"));
        slice.slice_name = Some(slice_name.to_string());
        slice.min = Some(0);
        slice.max = max;
        slice.type_ = type_;
        slice.base = base;
        elements.insert(insert_at, slice);
    }
    insert_at
}

/// Create a child node under a slice by cloning the base element's child.
fn materialize_slice_child(
    sd: &mut StructureDefinition,
    base_child_id: &str,
    slice_id: &str,
    new_id: &str,
) {
    let template_idx = find_by_id(sd, base_child_id).expect("base child must exist");
    let slice_idx = find_by_id(sd, slice_id).expect("slice must exist");
    let insert_at = end_of_subtree(sd, slice_idx, slice_id);

    let mut child = sd.elements()[template_idx].clone();
    child.id = Some(new_id.to_string());
    child.original = None;
    sd.elements_mut().insert(insert_at, child);
}

/// First position after the element at `idx` and everything nested beneath
/// it (children and slices alike).
pub fn end_of_subtree(sd: &StructureDefinition, idx: usize, id: &str) -> usize {
    let child_prefix = format!("{id}.");
    let slice_prefix = format!("{id}:");
    let mut end = idx + 1;
    for (offset, element) in sd.elements()[idx + 1..].iter().enumerate() {
        let element_id = element.id_or_path();
        if element_id.starts_with(&child_prefix) || element_id.starts_with(&slice_prefix) {
            end = idx + 2 + offset;
        } else {
            break;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fhir_types::{
        ElementDefinitionType, StructureDefinitionKind, StructureDefinitionSnapshot,
    };

    fn element(path: &str, max: &str, type_code: Option<&str>) -> ElementDefinition {
        let mut elem = ElementDefinition::new(path);
        elem.min = Some(0);
        elem.max = Some(max.to_string());
        elem.type_ = type_code.map(|c| vec![ElementDefinitionType::new(c)]);
        elem
    }

    fn patient_like() -> StructureDefinition {
        let mut sd = StructureDefinition::new(
            "http://example.org/StructureDefinition/Patient".to_string(),
            "Patient".to_string(),
            "Patient".to_string(),
            StructureDefinitionKind::Resource,
        );
        sd.snapshot = Some(StructureDefinitionSnapshot {
            element: vec![
                element("Patient", "*", None),
                element("Patient.identifier", "*", Some("Identifier")),
                element("Patient.identifier.system", "1", Some("uri")),
                element("Patient.identifier.value", "1", Some("string")),
                element("Patient.deceased[x]", "1", Some("boolean")),
                element("Patient.address", "*", Some("Address")),
                element("Patient.address.line", "*", Some("string")),
            ],
        });
        sd
    }

    #[test]
    fn test_parse_simple_path() {
        let segments = parse_fsh_path("name.given").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].base, "name");
        assert!(segments[0].brackets.is_empty());
        assert_eq!(segments[1].base, "given");
    }

    #[test]
    fn test_parse_brackets() {
        let segments = parse_fsh_path("contact[0].telecom[home].value[x]").unwrap();
        assert_eq!(segments[0].brackets, vec![Bracket::Index(0)]);
        assert_eq!(segments[1].brackets, vec![Bracket::Slice("home".to_string())]);
        assert_eq!(segments[2].brackets, vec![Bracket::ChoiceType]);
    }

    #[test]
    fn test_parse_invalid_paths() {
        assert!(parse_fsh_path("").is_err());
        assert!(parse_fsh_path("a..b").is_err());
        assert!(parse_fsh_path("a.").is_err());
        assert!(parse_fsh_path("a[unclosed").is_err());
    }

    #[test]
    fn test_resolve_nested_path() {
        let mut sd = patient_like();
        let idx = resolve_element(&mut sd, "identifier.system").unwrap();
        assert_eq!(sd.elements()[idx].path, "Patient.identifier.system");
    }

    #[test]
    fn test_resolve_choice_path() {
        let mut sd = patient_like();
        let idx = resolve_element(&mut sd, "deceased[x]").unwrap();
        assert_eq!(sd.elements()[idx].path, "Patient.deceased[x]");
    }

    #[test]
    fn test_resolve_empty_path_is_root() {
        let mut sd = patient_like();
        assert_eq!(resolve_element(&mut sd, "").unwrap(), 0);
    }

    #[test]
    fn test_resolve_unknown_field_fails() {
        let mut sd = patient_like();
        let err = resolve_element(&mut sd, "identifier.nothing").unwrap_err();
        assert!(matches!(err, PathError::NotFound { .. }));
        let err = resolve_element(&mut sd, "bogus").unwrap_err();
        assert!(matches!(err, PathError::NotFound { .. }));
    }

    #[test]
    fn test_index_is_plain_repetition_marker() {
        let mut sd = patient_like();
        let before = sd.elements().len();

        let first = resolve_element(&mut sd, "address[0].line[1]").unwrap();
        let second = resolve_element(&mut sd, "address[0].line[1]").unwrap();

        assert_eq!(first, second);
        assert_eq!(sd.elements()[first].path, "Patient.address.line");
        // No nodes materialized for plain indices
        assert_eq!(sd.elements().len(), before);
    }

    #[test]
    fn test_slice_materialization_is_idempotent() {
        let mut sd = patient_like();
        let before = sd.elements().len();

        let first = resolve_element(&mut sd, "identifier[mrn]").unwrap();
        assert_eq!(sd.elements().len(), before + 1);
        let slice = &sd.elements()[first];
        assert_eq!(slice.id_or_path(), "Patient.identifier:mrn");
        assert_eq!(slice.slice_name.as_deref(), Some("mrn"));
        assert_eq!(slice.min, Some(0));

        let second = resolve_element(&mut sd, "identifier[mrn]").unwrap();
        assert_eq!(first, second);
        assert_eq!(sd.elements().len(), before + 1);
    }

    #[test]
    fn test_slice_gets_default_slicing_descriptor() {
        let mut sd = patient_like();
        resolve_element(&mut sd, "identifier[mrn]").unwrap();
        let base = sd.find_element("Patient.identifier").unwrap();
        let slicing = base.slicing.as_ref().unwrap();
        assert_eq!(slicing.rules, "open");
        assert_eq!(slicing.ordered, Some(false));
    }

    #[test]
    fn test_slice_child_materialization() {
        let mut sd = patient_like();
        let idx = resolve_element(&mut sd, "identifier[mrn].system").unwrap();
        let child = &sd.elements()[idx];
        assert_eq!(child.id_or_path(), "Patient.identifier:mrn.system");
        assert_eq!(child.path, "Patient.identifier.system");

        // The node sits inside the slice's subtree, after the slice element
        let slice_idx = find_by_id(&sd, "Patient.identifier:mrn").unwrap();
        assert!(idx > slice_idx);

        // Idempotent
        let again = resolve_element(&mut sd, "identifier[mrn].system").unwrap();
        assert_eq!(idx, again);
    }

    #[test]
    fn test_second_slice_ordering() {
        let mut sd = patient_like();
        resolve_element(&mut sd, "identifier[mrn].system").unwrap();
        let ssn_idx = resolve_element(&mut sd, "identifier[ssn]").unwrap();

        // ssn slice comes after the mrn slice and its children
        let mrn_child = find_by_id(&sd, "Patient.identifier:mrn.system").unwrap();
        assert!(ssn_idx > mrn_child);
        // and before the next top-level element
        let deceased = find_by_id(&sd, "Patient.deceased[x]").unwrap();
        assert!(ssn_idx < deceased);
    }
}
