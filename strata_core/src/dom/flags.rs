use super::codec;
use super::element::{Endian, FlagSpec, FlagsSpec};
use super::{DataModel, ElementId, ElementKind};
use crate::bitstream::BitStream;
use crate::error::{StrataError, StrataResult};

/// Left shift of a flag's value inside the packed integer.
pub(crate) fn flag_shift(spec: FlagsSpec, flag: FlagSpec) -> u32 {
    match spec.endian {
        Endian::Big => spec.size - flag.position - flag.size,
        Endian::Little => flag.position,
    }
}

impl DataModel {
    /// Rejects flags that do not fit inside `parent` or share bits with a sibling.
    pub(crate) fn check_flag_placement(
        &self,
        parent: ElementId,
        spec: FlagsSpec,
        child: ElementId,
    ) -> StrataResult<()> {
        let name = &self[child].name;
        let ElementKind::Flag(flag) = self[child].kind else {
            return Err(StrataError::construction(
                self[parent].full_name.clone(),
                format!("Flags elements only hold Flag children, not {}.", self[child].type_name()),
            ));
        };
        if flag.position + flag.size > spec.size {
            return Err(StrataError::construction(
                self[parent].full_name.clone(),
                format!("Flag '{name}' is placed outside its parent."),
            ));
        }
        for sibling in &self[parent].children {
            if let ElementKind::Flag(other) = self[*sibling].kind {
                let disjoint = flag.position + flag.size <= other.position
                    || other.position + other.size <= flag.position;
                if !disjoint {
                    return Err(StrataError::construction(
                        self[parent].full_name.clone(),
                        format!("Flag '{name}' overlaps with flag '{}'.", self[*sibling].name),
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn flags_value(&mut self, id: ElementId) -> StrataResult<BitStream> {
        let ElementKind::Flags(spec) = self[id].kind else {
            return Ok(BitStream::new());
        };
        let mut packed = 0u64;
        for child in self[id].children.clone() {
            let ElementKind::Flag(flag) = self[child].kind else {
                continue;
            };
            let bits = self.value(child)?;
            let width = bits.len_bits().min(u64::from(flag.size));
            let raw = if width == 0 { 0 } else { bits.peek_bits(0, width)?.read_bits(width)? };
            packed |= (raw & codec::mask(flag.size)) << flag_shift(spec, flag);
        }
        Ok(codec::encode_integer(packed, spec.size, spec.endian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Variant;
    use proptest::prelude::*;

    fn flags_model(endian: Endian, values: [u64; 3]) -> (DataModel, ElementId) {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let flags = model.add_element(root, "F", ElementKind::flags(8, endian)).unwrap();
        let layout = [(0, 1), (1, 2), (5, 3)];
        for (i, ((position, size), value)) in layout.into_iter().zip(values).enumerate() {
            let flag = model
                .add_element(flags, &format!("f{i}"), ElementKind::flag(position, size))
                .unwrap();
            model.set_default_value(flag, Variant::ULong(value)).unwrap();
        }
        (model, flags)
    }

    #[test]
    fn little_endian_positions_count_from_the_low_bit() {
        let (mut model, flags) = flags_model(Endian::Little, [1, 2, 5]);
        assert_eq!(model.value(flags).unwrap().as_bytes(), &[0b1010_0101]);
    }

    #[test]
    fn big_endian_positions_count_from_the_high_bit() {
        let (mut model, flags) = flags_model(Endian::Big, [1, 2, 5]);
        assert_eq!(model.value(flags).unwrap().as_bytes(), &[0b1100_0101]);
    }

    #[test]
    fn overlapping_and_outside_flags_are_rejected() {
        let mut model = DataModel::new("Model").unwrap();
        let root = model.root();
        let flags = model.add_element(root, "F", ElementKind::flags(8, Endian::Big)).unwrap();
        model.add_element(flags, "a", ElementKind::flag(0, 4)).unwrap();
        let err = model.add_element(flags, "b", ElementKind::flag(3, 2)).unwrap_err();
        assert!(err.to_string().contains("Flag 'b' overlaps with flag 'a'"), "{err}");
        let err = model.add_element(flags, "c", ElementKind::flag(6, 4)).unwrap_err();
        assert!(err.to_string().contains("is placed outside its parent"), "{err}");
    }

    proptest! {
        #[test]
        fn packing_keeps_every_flag_value(
            a in 0u64..2,
            b in 0u64..4,
            c in 0u64..8,
            little in any::<bool>()
        ) {
            let endian = if little { Endian::Little } else { Endian::Big };
            let (mut model, flags) = flags_model(endian, [a, b, c]);
            let packed = model.value(flags).unwrap();
            prop_assert_eq!(packed.len_bits(), 8);
            let ElementKind::Flags(spec) = model[flags].kind else { unreachable!() };
            let raw = codec::decode_integer(&mut packed.clone(), 8, endian).unwrap();
            let expectations = [(0, 1, a), (1, 2, b), (5, 3, c)];
            for (i, (position, size, expected)) in expectations.into_iter().enumerate() {
                let shift = flag_shift(spec, FlagSpec { position, size });
                prop_assert_eq!((raw >> shift) & codec::mask(size), expected, "flag {}", i);
            }
        }
    }
}
