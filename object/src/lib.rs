pub mod layout;
mod map_word;
mod object;
mod shape;
mod value;
mod visitor;

pub use map_word::MapWord;
pub use object::{Address, HeapObject, OBJECT_ALIGNMENT, Slot, WORD_SIZE, align_object_size};
pub use shape::{Shape, ShapeFlags, ShapeId, ShapeTable, VisitorKind};
pub use value::Value;
pub use visitor::{
    ObjectVisitor, iterate_body, iterate_body_with_shape, object_size, size_with_shape,
};

#[cfg(test)]
mod tests {
    use super::*;

    /// Word-aligned scratch memory standing in for a heap page.
    fn scratch(words: usize) -> Vec<u64> {
        vec![0u64; words]
    }

    fn object_at(buf: &mut [u64], word: usize) -> HeapObject {
        HeapObject::from_address(buf.as_mut_ptr() as usize + word * WORD_SIZE)
    }

    #[derive(Default)]
    struct Collect {
        strong: Vec<Slot>,
        weak: Vec<Slot>,
        descriptors: Vec<(Slot, usize)>,
        ephemerons: Vec<usize>,
    }

    impl ObjectVisitor for Collect {
        fn visit_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
            self.strong.extend(Slot::range(start, end));
        }

        fn visit_weak_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
            self.weak.extend(Slot::range(start, end));
        }

        fn visit_descriptors(&mut self, _host: HeapObject, slot: Slot, own: usize) {
            self.descriptors.push((slot, own));
        }

        fn visit_ephemerons(&mut self, _host: HeapObject, start: Slot, end: Slot) {
            self.ephemerons.push(Slot::range(start, end).count() / 2);
        }
    }

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn smi_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, (1 << 62) - 1, -(1 << 62)] {
            let v = Value::smi(n);
            assert!(v.is_smi());
            assert!(!v.is_object());
            assert_eq!(v.to_smi(), Some(n));
        }
        assert_eq!(Value::smi(0), Value::ZERO);
        assert!(!Value::fits_smi(1 << 62));
    }

    #[test]
    fn object_tagging() {
        let mut buf = scratch(2);
        let object = object_at(&mut buf, 0);
        let v = Value::from_object(object);
        assert!(v.is_object());
        assert!(!v.is_smi());
        assert_eq!(v.as_object(), Some(object));
        assert_eq!(Value::smi(7).as_object(), None);
    }

    // ── Map words ──────────────────────────────────────────────────

    #[test]
    fn map_word_never_looks_like_a_value() {
        let word = MapWord::Shape(ShapeId::FIXED_ARRAY).encode();
        let v = Value::from_raw(word);
        assert!(!v.is_smi());
        assert!(!v.is_object());
        assert!(MapWord::is_shape(word));

        let mut buf = scratch(2);
        let target = object_at(&mut buf, 0);
        let fwd = MapWord::Forwarded(target).encode();
        assert!(MapWord::is_forwarded(fwd));
        assert!(!Value::from_raw(fwd).is_smi());
        assert!(!Value::from_raw(fwd).is_object());
        assert_eq!(MapWord::decode(fwd).forwarding_target(), Some(target));
        assert_eq!(MapWord::decode(word), MapWord::Shape(ShapeId::FIXED_ARRAY));
    }

    #[test]
    #[should_panic(expected = "corrupt map word")]
    fn decoding_a_smi_as_map_word_panics() {
        MapWord::decode(Value::smi(3).raw());
    }

    // ── Shapes ─────────────────────────────────────────────────────

    #[test]
    fn builtin_shapes_have_fixed_ids() {
        let shapes = ShapeTable::new();
        assert_eq!(shapes.len(), ShapeId::FIRST_USER.index());
        assert_eq!(shapes.kind(ShapeId::FILLER), VisitorKind::Filler);
        assert_eq!(shapes.kind(ShapeId::MAP), VisitorKind::Map);
        assert_eq!(shapes.kind(ShapeId::COW_FIXED_ARRAY), VisitorKind::FixedArray);
        assert!(shapes.get(ShapeId::COW_FIXED_ARRAY).is_immutable());
        assert!(!shapes.get(ShapeId::FIXED_ARRAY).is_immutable());
        assert!(shapes.get(ShapeId::BYTE_STRING).is_immutable());
    }

    #[test]
    fn registering_user_shapes() {
        let mut shapes = ShapeTable::new();
        let point = shapes.register_struct("point", 2, ShapeFlags::NONE);
        let blob = shapes.register_data("blob", 3, ShapeFlags::IMMUTABLE);
        assert_eq!(point, ShapeId::FIRST_USER);
        assert_eq!(blob.0, ShapeId::FIRST_USER.0 + 1);
        assert_eq!(shapes.get(point).instance_size, Some(24));
        assert_eq!(shapes.get(blob).instance_size, Some(32));
        assert!(shapes.get(blob).is_immutable());
    }

    #[test]
    #[should_panic(expected = "unknown shape id")]
    fn unknown_shape_panics() {
        ShapeTable::new().get(ShapeId(999));
    }

    // ── Layout and sizes ───────────────────────────────────────────

    #[test]
    fn size_rules() {
        assert_eq!(layout::byte_array_size(0), 16);
        assert_eq!(layout::byte_array_size(1), 24);
        assert_eq!(layout::byte_array_size(8), 24);
        assert_eq!(layout::fixed_array_size(3), 40);
        assert_eq!(layout::ephemeron_table_size(2), 48);
        assert_eq!(layout::code_size(5), 32);
    }

    #[test]
    fn fillers_report_their_size() {
        let shapes = ShapeTable::new();
        let mut buf = scratch(8);
        let one = object_at(&mut buf, 0);
        let big = object_at(&mut buf, 1);
        unsafe {
            layout::write_filler(one.address(), WORD_SIZE);
            layout::write_filler(big.address(), 7 * WORD_SIZE);
            assert_eq!(one.shape(), ShapeId::ONE_WORD_FILLER);
            assert_eq!(object_size(&shapes, one), 8);
            assert_eq!(big.shape(), ShapeId::FILLER);
            assert_eq!(object_size(&shapes, big), 56);
        }
    }

    #[test]
    fn byte_array_padding_is_zeroed() {
        let shapes = ShapeTable::new();
        let mut buf = vec![u64::MAX; 4];
        let object = object_at(&mut buf, 0);
        unsafe {
            layout::init_byte_array(object, ShapeId::BYTE_ARRAY, 3);
            assert_eq!(object_size(&shapes, object), 24);
            assert_eq!(object.raw_word(layout::byte_array::DATA_OFFSET), 0);
        }
    }

    // ── Visiting ───────────────────────────────────────────────────

    #[test]
    fn fixed_array_slots_are_strong() {
        let shapes = ShapeTable::new();
        let mut buf = scratch(5);
        let object = object_at(&mut buf, 0);
        let mut v = Collect::default();
        unsafe {
            layout::init_fixed_array(object, ShapeId::FIXED_ARRAY, 3, Value::ZERO);
            iterate_body(&shapes, object, &mut v);
        }
        assert_eq!(
            v.strong,
            vec![object.slot(16), object.slot(24), object.slot(32)]
        );
        assert!(v.weak.is_empty());
    }

    #[test]
    fn weak_cells_and_weak_arrays_report_weak_slots() {
        let shapes = ShapeTable::new();
        let mut buf = scratch(6);
        let cell = object_at(&mut buf, 0);
        let array = object_at(&mut buf, 2);
        let mut v = Collect::default();
        unsafe {
            layout::init_weak_cell(cell, Value::ZERO);
            layout::init_fixed_array(array, ShapeId::WEAK_ARRAY, 2, Value::ZERO);
            iterate_body(&shapes, cell, &mut v);
            iterate_body(&shapes, array, &mut v);
        }
        assert!(v.strong.is_empty());
        assert_eq!(
            v.weak,
            vec![cell.slot(8), array.slot(16), array.slot(24)]
        );
    }

    #[test]
    fn map_reports_each_field_by_strength() {
        let shapes = ShapeTable::new();
        let mut buf = scratch(6);
        let map = object_at(&mut buf, 0);
        let mut v = Collect::default();
        unsafe {
            layout::init_map(map, Value::ZERO, Value::ZERO, 4);
            iterate_body(&shapes, map, &mut v);
        }
        assert_eq!(v.strong, vec![map.slot(layout::map::PROTOTYPE_OFFSET)]);
        assert_eq!(
            v.weak,
            vec![
                map.slot(layout::map::BACK_POINTER_OFFSET),
                map.slot(layout::map::TRANSITIONS_OFFSET)
            ]
        );
        assert_eq!(
            v.descriptors,
            vec![(map.slot(layout::map::DESCRIPTORS_OFFSET), 4)]
        );
    }

    #[test]
    fn ephemeron_default_visits_all_pairs() {
        struct Strong(Vec<Slot>);
        impl ObjectVisitor for Strong {
            fn visit_pointers(&mut self, _host: HeapObject, start: Slot, end: Slot) {
                self.0.extend(Slot::range(start, end));
            }
        }

        let shapes = ShapeTable::new();
        let mut buf = scratch(6);
        let table = object_at(&mut buf, 0);
        let mut v = Strong(Vec::new());
        unsafe {
            layout::init_ephemeron_table(table, 2);
            iterate_body(&shapes, table, &mut v);
        }
        assert_eq!(v.0.len(), 4);

        let mut c = Collect::default();
        unsafe { iterate_body(&shapes, table, &mut c) };
        assert_eq!(c.ephemerons, vec![2]);
    }

    #[test]
    fn data_objects_have_no_slots() {
        let mut shapes = ShapeTable::new();
        let blob = shapes.register_data("blob", 2, ShapeFlags::NONE);
        let mut buf = scratch(3);
        let object = object_at(&mut buf, 0);
        let mut v = Collect::default();
        unsafe {
            object.set_map_word(MapWord::Shape(blob));
            iterate_body(&shapes, object, &mut v);
            assert_eq!(object_size(&shapes, object), 24);
        }
        assert!(v.strong.is_empty() && v.weak.is_empty());
    }
}
