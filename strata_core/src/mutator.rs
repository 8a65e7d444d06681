use crate::bitstream::BitStream;
use crate::dom::{DataModel, ElementId, ElementKind, MutateOverride};
use crate::variant::Variant;
use rand::Rng;
use rand::seq::index::sample;
use tracing::debug;

/// Upper bound on the bits `FlipBitsMutator` flips in one call.
const DEFAULT_MAX_FLIPPED_BITS: u64 = 8;
/// Largest count `ArrayCountMutator` picks when it grows an array.
const DEFAULT_MAX_ARRAY_COUNT: u64 = 255;

/// A `Mutator` changes one element of a [`DataModel`] in place.
///
/// Mutators are the engine of the fuzzing loop: each call picks a target among
/// the elements it knows how to change and leaves the model ready to be
/// regenerated.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Applies one mutation.
    ///
    /// # Returns
    /// `Result<Option<ElementId>, anyhow::Error>`:
    ///   - `Ok(Some(id))`: The element that was changed.
    ///   - `Ok(None)`: The model holds nothing this mutator can change.
    ///   - `Err(error)`: Generating or updating the model failed.
    fn mutate(
        &mut self,
        model: &mut DataModel,
        rng: &mut R,
    ) -> Result<Option<ElementId>, anyhow::Error>;
}

/// Mutable elements that take part in generation, matching `accept`.
///
/// The model is generated first so arrays are expanded and choices resolved.
fn candidates(
    model: &mut DataModel,
    accept: impl Fn(&DataModel, ElementId) -> bool,
) -> Result<Vec<ElementId>, anyhow::Error> {
    let root = model.root();
    model.value(root)?;
    let model: &DataModel = model;
    Ok(model
        .walk(root)
        .into_iter()
        .filter(|id| model[*id].is_mutable() && accept(model, *id))
        .collect())
}

fn pick<R: Rng + ?Sized>(items: &[ElementId], rng: &mut R) -> Option<ElementId> {
    if items.is_empty() {
        return None;
    }
    Some(items[rng.random_range(0..items.len())])
}

/// Flips a few random bits of a leaf's generated value and stores the result as
/// its final bit representation.
#[derive(Debug, Clone, Copy)]
pub struct FlipBitsMutator {
    max_flipped_bits: u64,
}

impl FlipBitsMutator {
    pub fn new(max_flipped_bits: u64) -> Self {
        Self {
            max_flipped_bits: max_flipped_bits.max(1),
        }
    }
}

impl Default for FlipBitsMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FLIPPED_BITS)
    }
}

impl<R: Rng + ?Sized> Mutator<R> for FlipBitsMutator {
    fn name(&self) -> &'static str {
        "FlipBits"
    }

    fn mutate(
        &mut self,
        model: &mut DataModel,
        rng: &mut R,
    ) -> Result<Option<ElementId>, anyhow::Error> {
        let leaves = candidates(model, |m, id| {
            !m[id].kind().is_container() && !matches!(m[id].kind(), ElementKind::Padding(_))
        })?;
        let mut sized = Vec::with_capacity(leaves.len());
        for id in leaves {
            if !model.value(id)?.is_empty() {
                sized.push(id);
            }
        }
        let Some(target) = pick(&sized, rng) else {
            return Ok(None);
        };

        let value = model.value(target)?;
        let len = value.len_bits();
        let mut bytes = value.to_bytes();
        let flips = rng.random_range(1..=self.max_flipped_bits.min(len));
        for bit in sample(rng, len as usize, flips as usize) {
            bytes[bit / 8] ^= 0x80 >> (bit % 8);
        }
        let mutated = BitStream::from_bits(bytes, len);
        debug!(element = %model[target].full_name(), flips, "Flipped bits");
        model.set_mutated_value(
            target,
            Some(Variant::Bits(mutated)),
            MutateOverride::TYPE_TRANSFORM,
        );
        Ok(Some(target))
    }
}

/// Forces a random item count on an array. Counts past the stored items are
/// produced virtually by repeating the last one.
#[derive(Debug, Clone, Copy)]
pub struct ArrayCountMutator {
    max_count: u64,
}

impl ArrayCountMutator {
    pub fn new(max_count: u64) -> Self {
        Self { max_count }
    }
}

impl Default for ArrayCountMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ARRAY_COUNT)
    }
}

impl<R: Rng + ?Sized> Mutator<R> for ArrayCountMutator {
    fn name(&self) -> &'static str {
        "ArrayCount"
    }

    fn mutate(
        &mut self,
        model: &mut DataModel,
        rng: &mut R,
    ) -> Result<Option<ElementId>, anyhow::Error> {
        let arrays = candidates(model, |m, id| matches!(m[id].kind(), ElementKind::Array(_)))?;
        let Some(target) = pick(&arrays, rng) else {
            return Ok(None);
        };

        let current = model.array_count(target);
        let count = match rng.random_range(0..4) {
            0 => 0,
            1 => current.saturating_sub(1),
            2 => current.saturating_add(1).min(self.max_count.max(1)),
            _ => rng.random_range(0..=self.max_count),
        };
        debug!(array = %model[target].full_name(), current, count, "Overriding item count");
        model.set_count_override(target, Some(count), None)?;
        Ok(Some(target))
    }
}

/// Switches a random choice to a different option.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChoiceSwitchMutator;

impl<R: Rng + ?Sized> Mutator<R> for ChoiceSwitchMutator {
    fn name(&self) -> &'static str {
        "ChoiceSwitch"
    }

    fn mutate(
        &mut self,
        model: &mut DataModel,
        rng: &mut R,
    ) -> Result<Option<ElementId>, anyhow::Error> {
        let choices = candidates(model, |m, id| match m[id].kind() {
            ElementKind::Choice(state) => state.pool().members().len() > 1,
            _ => false,
        })?;
        let Some(target) = pick(&choices, rng) else {
            return Ok(None);
        };

        let current = model.selected(target).map(|s| model[s].name().to_string());
        let options: Vec<String> = match model[target].kind() {
            ElementKind::Choice(state) => state
                .pool()
                .members()
                .iter()
                .map(|m| model[*m].name().to_string())
                .filter(|name| Some(name) != current.as_ref())
                .collect(),
            _ => Vec::new(),
        };
        let Some(option) = options.get(rng.random_range(0..options.len().max(1))) else {
            return Ok(None);
        };
        debug!(
            choice = %model[target].full_name(),
            from = ?current,
            to = %option,
            "Switching option"
        );
        model.select_element(target, option)?;
        Ok(Some(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Endian, LengthType};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn run(
        mutator: &mut impl Mutator<ChaCha8Rng>,
        model: &mut DataModel,
        rng: &mut ChaCha8Rng,
    ) -> Option<ElementId> {
        mutator.mutate(model, rng).unwrap()
    }

    fn model() -> DataModel {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let magic = model.add_element(root, "magic", ElementKind::Blob).unwrap();
        model.set_default_value(magic, Variant::from("MZ")).unwrap();

        let array = model.add_element(root, "Items", ElementKind::array()).unwrap();
        let item = model
            .add_element(array, "Item", ElementKind::number(8, false, Endian::Big))
            .unwrap();
        model.set_default_value(item, Variant::Int(1)).unwrap();
        model.set_occurs(array, 0, None, 2).unwrap();

        let choice = model.add_element(root, "C", ElementKind::choice()).unwrap();
        for name in ["A", "B", "C"] {
            let option = model.add_element(choice, name, ElementKind::Blob).unwrap();
            model.set_length(option, Some(1), LengthType::Bytes).unwrap();
            model.set_default_value(option, Variant::from(name)).unwrap();
        }
        model
    }

    #[test]
    fn flip_bits_changes_one_leaf() {
        let mut model = model();
        let root = model.root();
        let before = model.value(root).unwrap();
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let mut mutator = FlipBitsMutator::default();

        let target = run(&mut mutator, &mut model, &mut rng).unwrap();
        assert!(!model[target].kind().is_container());
        assert_eq!(model[target].mutation_flags(), MutateOverride::TYPE_TRANSFORM);
        let after = model.value(root).unwrap();
        assert_eq!(after.len_bits(), before.len_bits(), "Bit flips keep the length");
        assert_ne!(after.as_bytes(), before.as_bytes());
    }

    #[test]
    fn flip_bits_skips_models_without_leaves() {
        let mut model = DataModel::new("Empty").unwrap();
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let mut mutator = FlipBitsMutator::default();
        assert_eq!(run(&mut mutator, &mut model, &mut rng), None);
    }

    #[test]
    fn array_count_overrides_generation() {
        let mut model = model();
        let root = model.root();
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        let mut mutator = ArrayCountMutator::new(16);

        for _ in 0..10 {
            let array = run(&mut mutator, &mut model, &mut rng).unwrap();
            let count = model.array_count(array);
            assert!(count <= 16, "count {count} is over the limit");
            assert_eq!(model.value(array).unwrap().len_bytes(), count);
            assert_eq!(model.value(root).unwrap().len_bytes(), 2 + count + 1);
        }
    }

    #[test]
    fn choice_switch_always_picks_another_option() {
        let mut model = model();
        let root = model.root();
        model.value(root).unwrap();
        let choice = model.element_by_full_name("Model.C").unwrap();
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let mut mutator = ChoiceSwitchMutator;

        for _ in 0..10 {
            let before = model[model.selected(choice).unwrap()].name().to_string();
            let switched = run(&mut mutator, &mut model, &mut rng);
            assert_eq!(switched, Some(choice));
            let after = model[model.selected(choice).unwrap()].name().to_string();
            assert_ne!(before, after);
            let bytes = model.value(root).unwrap();
            assert_eq!(bytes.as_bytes().last().copied(), Some(after.as_bytes()[0]));
        }
    }
}
