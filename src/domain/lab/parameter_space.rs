//! Parameter Space & Combinator (C7): descriptors → finite, deterministic enumeration.

use crate::domain::lab::errors::{LabError, LabResult};
use crate::domain::lab::types::{ParamValue, ParameterAssignment, ParameterDescriptor, ParameterKind};
use rust_decimal::Decimal;

/// Values a single descriptor contributes to the Cartesian product, already in
/// ascending canonical order.
fn descriptor_values(descriptor: &ParameterDescriptor) -> LabResult<Vec<ParamValue>> {
    if descriptor.locked {
        return Ok(vec![descriptor.default.clone()]);
    }
    if !descriptor.enabled {
        return Ok(vec![descriptor.default.clone()]);
    }

    match descriptor.kind {
        ParameterKind::Number => {
            let (min, max, step) = match (descriptor.min, descriptor.max, descriptor.step) {
                (Some(min), Some(max), Some(step)) => (min, max, step),
                _ => {
                    return Err(LabError::ConfigInvalid {
                        reason: format!(
                            "parameter '{}' is enabled but missing min/max/step",
                            descriptor.name
                        ),
                    });
                }
            };
            if step <= Decimal::ZERO || min > max {
                return Err(LabError::ConfigInvalid {
                    reason: format!("parameter '{}' has an empty numeric range", descriptor.name),
                });
            }
            let mut values = Vec::new();
            let mut v = min;
            // small tolerance so e.g. 0.1 + 0.1 + 0.1 still reaches 0.3 exactly with Decimal
            let tolerance = step / Decimal::from(1_000_000);
            while v <= max + tolerance {
                values.push(ParamValue::Number(v));
                v += step;
            }
            if values.is_empty() {
                return Err(LabError::ConfigInvalid {
                    reason: format!("parameter '{}' produced an empty range", descriptor.name),
                });
            }
            Ok(values)
        }
        ParameterKind::Boolean => Ok(vec![
            ParamValue::Boolean(false),
            ParamValue::Boolean(true),
        ]),
        ParameterKind::Enum => {
            let mut values = descriptor
                .enum_values
                .clone()
                .unwrap_or_else(|| vec![descriptor.default.to_string()]);
            values.sort();
            Ok(values.into_iter().map(ParamValue::Enum).collect())
        }
    }
}

/// Computes cardinality and (if within `combination_limit`) the full enumeration, in
/// canonical order: descriptors sorted by name, values ascending within each.
pub fn enumerate(
    descriptors: &[ParameterDescriptor],
    combination_limit: u64,
) -> LabResult<Vec<ParameterAssignment>> {
    let mut sorted: Vec<&ParameterDescriptor> = descriptors.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut per_descriptor_values = Vec::with_capacity(sorted.len());
    let mut cardinality: u64 = 1;
    for descriptor in &sorted {
        let values = descriptor_values(descriptor)?;
        cardinality = cardinality.saturating_mul(values.len() as u64);
        per_descriptor_values.push(values);
    }

    if cardinality > combination_limit {
        return Err(LabError::TooManyCombinations {
            count: cardinality,
            limit: combination_limit,
        });
    }

    let mut assignments = vec![ParameterAssignment::new()];
    for (descriptor, values) in sorted.iter().zip(per_descriptor_values.iter()) {
        let mut next = Vec::with_capacity(assignments.len() * values.len());
        for existing in &assignments {
            for value in values {
                let mut extended = existing.clone();
                extended.insert(descriptor.name.clone(), value.clone());
                next.push(extended);
            }
        }
        assignments = next;
    }

    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn empty_parameter_space_yields_one_default_assignment() {
        let descriptors = vec![ParameterDescriptor::number("fast_sma", "trend", dec!(10))];
        let assignments = enumerate(&descriptors, 1000).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(
            assignments[0].get("fast_sma"),
            Some(&ParamValue::Number(dec!(10)))
        );
    }

    #[test]
    fn enumeration_completeness_no_duplicates() {
        let descriptors = vec![
            ParameterDescriptor::number("swing_lookback", "structure", dec!(30))
                .with_range(dec!(30), dec!(50), dec!(10))
                .enabled(),
            ParameterDescriptor::number("sweep_buffer_pips", "structure", dec!(0.5))
                .with_range(dec!(0.5), dec!(1.5), dec!(0.5))
                .enabled(),
        ];
        let assignments = enumerate(&descriptors, 1000).unwrap();
        assert_eq!(assignments.len(), 9);
        let unique: std::collections::HashSet<_> = assignments
            .iter()
            .map(|a| format!("{:?}", a))
            .collect();
        assert_eq!(unique.len(), 9);
    }

    #[test]
    fn lex_order_is_canonical() {
        let descriptors = vec![
            ParameterDescriptor::number("swing_lookback", "structure", dec!(30))
                .with_range(dec!(30), dec!(50), dec!(10))
                .enabled(),
            ParameterDescriptor::number("sweep_buffer_pips", "structure", dec!(0.5))
                .with_range(dec!(0.5), dec!(1.5), dec!(0.5))
                .enabled(),
        ];
        let assignments = enumerate(&descriptors, 1000).unwrap();
        let first = &assignments[0];
        assert_eq!(
            first.get("swing_lookback"),
            Some(&ParamValue::Number(dec!(30)))
        );
        assert_eq!(
            first.get("sweep_buffer_pips"),
            Some(&ParamValue::Number(dec!(0.5)))
        );
        let last = assignments.last().unwrap();
        assert_eq!(
            last.get("swing_lookback"),
            Some(&ParamValue::Number(dec!(50)))
        );
        assert_eq!(
            last.get("sweep_buffer_pips"),
            Some(&ParamValue::Number(dec!(1.5)))
        );
    }

    #[test]
    fn over_limit_fails_fast() {
        let descriptors = vec![
            ParameterDescriptor::number("a", "x", dec!(0))
                .with_range(dec!(0), dec!(9), dec!(1))
                .enabled(),
            ParameterDescriptor::number("b", "x", dec!(0))
                .with_range(dec!(0), dec!(9), dec!(1))
                .enabled(),
        ];
        let result = enumerate(&descriptors, 50);
        assert!(matches!(
            result,
            Err(LabError::TooManyCombinations { count: 100, limit: 50 })
        ));
    }

    #[test]
    fn boolean_descriptor_yields_both_values() {
        let mut descriptor = ParameterDescriptor::number("flag", "x", dec!(0));
        descriptor.kind = ParameterKind::Boolean;
        descriptor.default = ParamValue::Boolean(false);
        descriptor.enabled = true;
        let values = descriptor_values(&descriptor).unwrap();
        assert_eq!(
            values,
            vec![ParamValue::Boolean(false), ParamValue::Boolean(true)]
        );
    }
}
