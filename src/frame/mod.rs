//! Stack-frame layout.
//!
//! Locals and arguments are laid out once, before any instruction is
//! translated, into immutable slot tables. The builder is the only writer;
//! everything downstream reads offsets and types through the tables.

use crate::error::{CompileError, CompileResult};
use crate::model::ElementType;
use crate::resolve::TypeResolver;

/// One frame slot: byte offset, aligned byte size, declared type.
#[derive(Debug, Clone)]
pub struct Slot {
    pub offset: u32,
    pub size: u32,
    pub ty: ElementType,
}

/// Immutable local-variable slot table.
#[derive(Debug, Clone)]
pub struct LocalSlots {
    slots: Vec<Slot>,
    total_size: u32,
}

/// Immutable argument slot table. When the method is an instance method the
/// first slot is the implicit "this".
#[derive(Debug, Clone)]
pub struct ArgSlots {
    slots: Vec<Slot>,
    total_size: u32,
    has_this: bool,
}

impl LocalSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Count of locals whose storage is a heap reference.
    pub fn count_objects(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.ty.is_object_and_not_value_type())
            .count()
    }

    /// Index of the first heap-reference local, if any.
    pub fn first_object(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.ty.is_object_and_not_value_type())
    }

    /// Like `count_objects`, but also counts heap-reference fields embedded
    /// in value-type locals, recursing through nested value types.
    pub fn count_objects_deep(&self, resolver: &dyn TypeResolver) -> usize {
        let mut count = 0;
        for slot in &self.slots {
            count += count_object_refs(&slot.ty, resolver);
        }
        count
    }
}

/// Heap references reachable inside one value of `ty` without following any
/// reference (the value itself, or fields of an embedded value type).
pub fn count_object_refs(ty: &ElementType, resolver: &dyn TypeResolver) -> usize {
    if ty.is_object_and_not_value_type() {
        return 1;
    }
    if !ty.is_object() {
        return 0;
    }
    // value type with a class definition: walk its fields
    let Some(class) = ty.class_token else {
        return 0;
    };
    resolver
        .fields_of(class)
        .iter()
        .map(|f| count_object_refs(&f.ty, resolver))
        .sum()
}

impl ArgSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn has_this(&self) -> bool {
        self.has_this
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    /// Heap-reference arguments, never counting the implicit "this".
    pub fn count_objects(&self) -> usize {
        self.slots
            .iter()
            .skip(self.has_this as usize)
            .filter(|s| s.ty.is_object_and_not_value_type())
            .count()
    }

    /// Slots after the implicit "this", paired with their table index.
    pub fn explicit(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .skip(self.has_this as usize)
    }
}

/// Lays out slot tables against a type-size oracle.
pub struct FrameBuilder<'a> {
    resolver: &'a dyn TypeResolver,
    word: u32,
}

impl<'a> FrameBuilder<'a> {
    pub fn new(resolver: &'a dyn TypeResolver, word: u32) -> FrameBuilder<'a> {
        FrameBuilder { resolver, word }
    }

    fn slot_size(&self, method: &str, ty: &ElementType) -> CompileResult<u32> {
        let raw = self.resolver.type_size(ty);
        if raw == 0 {
            if ty.is_concrete() {
                return Err(CompileError::FrameLayout {
                    method: method.to_string(),
                    ty: ty.to_string(),
                });
            }
            // open generic or unresolved: reserve one machine word
            return Ok(self.word);
        }
        Ok(raw.div_ceil(self.word) * self.word)
    }

    fn layout(&self, method: &str, types: &[ElementType]) -> CompileResult<Vec<Slot>> {
        let mut slots = Vec::with_capacity(types.len());
        let mut offset = 0u32;
        for ty in types {
            let size = self.slot_size(method, ty)?;
            slots.push(Slot {
                offset,
                size,
                ty: ty.clone(),
            });
            offset += size;
        }
        Ok(slots)
    }

    pub fn layout_locals(&self, method: &str, locals: &[ElementType]) -> CompileResult<LocalSlots> {
        let slots = self.layout(method, locals)?;
        let total_size = slots.last().map_or(0, |s| s.offset + s.size);
        Ok(LocalSlots { slots, total_size })
    }

    /// Argument table; `this_ty` is prepended when present.
    pub fn layout_args(
        &self,
        method: &str,
        this_ty: Option<ElementType>,
        params: &[ElementType],
    ) -> CompileResult<ArgSlots> {
        let has_this = this_ty.is_some();
        let mut types = Vec::with_capacity(params.len() + has_this as usize);
        if let Some(t) = this_ty {
            types.push(t);
        }
        types.extend_from_slice(params);
        let slots = self.layout(method, &types)?;
        let total_size = slots.last().map_or(0, |s| s.offset + s.size);
        Ok(ArgSlots {
            slots,
            total_size,
            has_this,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModuleId, TableKind, Token, TypeKind};
    use crate::resolve::FieldInfo;

    struct FixedSizes;

    impl TypeResolver for FixedSizes {
        fn type_size(&self, ty: &ElementType) -> u32 {
            if ty.is_pointer_like() || ty.is_object_and_not_value_type() {
                return 8;
            }
            match ty.kind {
                TypeKind::ValueType => 12,
                k => k.fixed_size().unwrap_or(0),
            }
        }

        fn fields_of(&self, _ty: Token) -> Vec<FieldInfo> {
            vec![
                FieldInfo {
                    token: Token::build(ModuleId(0), TableKind::MemberRef, 1),
                    ty: ElementType::simple(TypeKind::I4),
                    offset: 0,
                },
                FieldInfo {
                    token: Token::build(ModuleId(0), TableKind::MemberRef, 2),
                    ty: ElementType::simple(TypeKind::Object),
                    offset: 4,
                },
            ]
        }

        fn base_of(&self, _ty: Token) -> Option<Token> {
            None
        }

        fn needs_member_teardown(&self, _ty: Token) -> bool {
            false
        }
    }

    fn typedef(row: u32) -> Token {
        Token::build(ModuleId(0), TableKind::TypeDef, row)
    }

    #[test]
    fn test_layout_is_monotonic_and_dense() {
        let b = FrameBuilder::new(&FixedSizes, 8);
        let locals = vec![
            ElementType::simple(TypeKind::I4),
            ElementType::value_type(typedef(1)),
            ElementType::simple(TypeKind::Object),
            ElementType::simple(TypeKind::I8),
        ];
        let table = b.layout_locals("T.m", &locals).unwrap();

        let mut sum = 0;
        for i in 0..table.len() {
            let s = table.get(i).unwrap();
            assert_eq!(s.offset, sum);
            sum += s.size;
            if i + 1 < table.len() {
                assert!(s.offset + s.size <= table.get(i + 1).unwrap().offset);
            }
        }
        assert_eq!(table.total_size(), sum);
        // 12-byte value type rounds up to 16
        assert_eq!(table.get(1).unwrap().size, 16);
    }

    #[test]
    fn test_zero_size_concrete_type_is_fatal() {
        let b = FrameBuilder::new(&FixedSizes, 8);
        let locals = vec![ElementType::simple(TypeKind::Void)];
        let err = b.layout_locals("T.m", &locals).unwrap_err();
        assert!(matches!(err, CompileError::FrameLayout { .. }));
    }

    #[test]
    fn test_open_generic_gets_word_slot() {
        let b = FrameBuilder::new(&FixedSizes, 8);
        let g = ElementType::generic_of(TypeKind::Void, typedef(9), vec![]);
        let table = b.layout_locals("T.m", &[g]).unwrap();
        assert_eq!(table.get(0).unwrap().size, 8);
    }

    #[test]
    fn test_object_counting() {
        let b = FrameBuilder::new(&FixedSizes, 8);
        let locals = vec![
            ElementType::simple(TypeKind::I4),
            ElementType::simple(TypeKind::Object),
            ElementType::class(typedef(2)),
        ];
        let table = b.layout_locals("T.m", &locals).unwrap();
        assert_eq!(table.count_objects(), 2);
        assert_eq!(table.first_object(), Some(1));
    }

    #[test]
    fn test_deep_counting_sees_value_type_fields() {
        let b = FrameBuilder::new(&FixedSizes, 8);
        // value type with one object field (per FixedSizes::fields_of)
        let locals = vec![
            ElementType::value_type(typedef(1)),
            ElementType::simple(TypeKind::Object),
        ];
        let table = b.layout_locals("T.m", &locals).unwrap();
        assert_eq!(table.count_objects(), 1);
        assert_eq!(table.count_objects_deep(&FixedSizes), 2);
    }

    #[test]
    fn test_args_skip_this() {
        let b = FrameBuilder::new(&FixedSizes, 8);
        let this = ElementType::class(typedef(1));
        let params = vec![
            ElementType::simple(TypeKind::Object),
            ElementType::simple(TypeKind::I4),
        ];
        let table = b.layout_args("T.m", Some(this), &params).unwrap();
        assert!(table.has_this());
        assert_eq!(table.len(), 3);
        assert_eq!(table.count_objects(), 1);
    }
}
