//! Debugging information entries and their attributes.

use std::borrow::Cow;
use std::cell::Cell;
use std::fmt;
use std::path::PathBuf;

use gimli::constants::{self, DwAt, DwTag};
use indexmap::IndexMap;

use crate::context::SchemaContext;
use crate::error::{DwarfError, Result};
use crate::form::{Form, RawValue};
use crate::reader::Reader;
use crate::unit::{UnitBases, UnitRef};

/// The value of an attribute after translation.
///
/// String offsets are dereferenced into their string sections, flags become booleans, and
/// indexed forms are resolved through the tables located by the unit's base attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeValue<'d> {
    /// Unsigned constants, unit-relative references, and untranslatable offsets.
    Unsigned(u64),
    /// Signed constants.
    Signed(i64),
    /// Flags.
    Flag(bool),
    /// Target addresses, including those resolved from `.debug_addr`.
    Address(u64),
    /// Offsets into another debug section, including those resolved from list offset tables.
    SecOffset(u64),
    /// Strings, without the terminator.
    String(&'d [u8]),
    /// Blocks and expressions.
    Block(&'d [u8]),
}

impl<'d> AttributeValue<'d> {
    /// Returns the value as an unsigned integer.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            AttributeValue::Unsigned(value)
            | AttributeValue::Address(value)
            | AttributeValue::SecOffset(value) => Some(value),
            AttributeValue::Signed(value) => Some(value as u64),
            AttributeValue::Flag(flag) => Some(flag.into()),
            _ => None,
        }
    }

    /// Returns the value as a signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            AttributeValue::Signed(value) => Some(value),
            AttributeValue::Unsigned(value) => Some(value as i64),
            _ => None,
        }
    }

    /// Returns the value of a flag.
    pub fn as_flag(&self) -> Option<bool> {
        match *self {
            AttributeValue::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    /// Returns the bytes of a string or block.
    pub fn as_bytes(&self) -> Option<&'d [u8]> {
        match *self {
            AttributeValue::String(bytes) | AttributeValue::Block(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns a string value, replacing invalid UTF-8.
    pub fn as_str(&self) -> Option<Cow<'d, str>> {
        match *self {
            AttributeValue::String(bytes) => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }
}

/// An attribute of a DIE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attribute<'d> {
    /// The attribute name.
    pub name: DwAt,
    /// The form the value was decoded with, after following `DW_FORM_indirect`.
    pub form: Form,
    /// The value as stored in the section.
    pub raw: RawValue<'d>,
    /// The translated value.
    pub value: AttributeValue<'d>,
    /// Section offset of the encoded value.
    pub offset: u64,
    /// How many `DW_FORM_indirect` codes preceded the value.
    pub indirection_depth: u32,
}

/// A debugging information entry.
///
/// A DIE with an abbreviation code of zero is a null entry. It has no tag and no attributes and
/// terminates a list of children.
pub struct Die<'d> {
    offset: u64,
    size: u64,
    abbrev_code: u64,
    tag: Option<DwTag>,
    has_children: bool,
    attributes: IndexMap<DwAt, Attribute<'d>>,
    terminator: Cell<Option<u64>>,
    parent: Cell<Option<u64>>,
}

impl<'d> Die<'d> {
    /// Parses the DIE at `offset`.
    ///
    /// Without `bases`, indexed attributes keep their raw index as value. This is the case while
    /// parsing the root DIE, which declares the bases itself; see [`Die::translate_indexed`].
    pub(crate) fn parse(
        unit: UnitRef<'d, '_>,
        offset: u64,
        bases: Option<&UnitBases>,
    ) -> Result<Self> {
        let info = unit.info;
        let ctx = unit.unit.ctx();
        let mut reader = ctx
            .reader_at(info.info_data()?, offset)
            .bounded(unit.unit.header().end())?;

        let abbrev_code = reader.uleb128()?;
        let mut die = Die {
            offset,
            size: 0,
            abbrev_code,
            tag: None,
            has_children: false,
            attributes: IndexMap::new(),
            terminator: Cell::new(None),
            parent: Cell::new(None),
        };

        if abbrev_code == 0 {
            die.size = reader.position() - offset;
            return Ok(die);
        }

        let table = info.abbrev_table(unit.unit.header().abbrev_offset)?;
        let decl = table
            .get(abbrev_code)
            .ok_or(DwarfError::AbbreviationNotFound {
                offset,
                code: abbrev_code,
            })?;

        die.tag = Some(decl.tag);
        die.has_children = decl.has_children;
        die.attributes.reserve(decl.attributes.len());

        for spec in &decl.attributes {
            let attr_offset = reader.position();
            let form = spec.form.ok_or(DwarfError::UnknownForm {
                offset: attr_offset,
                form: spec.form_code,
            })?;
            let (form, raw, indirection_depth) = match form {
                Form::ImplicitConst => (
                    Form::ImplicitConst,
                    RawValue::Signed(spec.implicit_const.unwrap_or_default()),
                    0,
                ),
                Form::Indirect => read_indirect(&mut reader, ctx)?,
                form => (form, form.read(&mut reader, ctx)?, 0),
            };

            let value = translate(unit, bases, form, raw)?;
            die.attributes.insert(
                spec.name,
                Attribute {
                    name: spec.name,
                    form,
                    raw,
                    value,
                    offset: attr_offset,
                    indirection_depth,
                },
            );
        }

        die.size = reader.position() - offset;
        Ok(die)
    }

    /// Re-translates indexed attributes once the unit's bases are known.
    pub(crate) fn translate_indexed(
        &mut self,
        unit: UnitRef<'d, '_>,
        bases: &UnitBases,
    ) -> Result<()> {
        for attr in self.attributes.values_mut() {
            if attr.form.is_indexed() {
                attr.value = translate(unit, Some(bases), attr.form, attr.raw)?;
            }
        }
        Ok(())
    }

    /// Section offset of the DIE.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the encoded DIE in bytes, not including its children.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The abbreviation code. Zero for null entries.
    pub fn abbrev_code(&self) -> u64 {
        self.abbrev_code
    }

    /// The tag, or `None` for null entries.
    pub fn tag(&self) -> Option<DwTag> {
        self.tag
    }

    /// Whether the DIE is followed by a list of children.
    pub fn has_children(&self) -> bool {
        self.has_children
    }

    /// Whether this is a null entry.
    pub fn is_null(&self) -> bool {
        self.tag.is_none()
    }

    /// Looks up an attribute by name.
    pub fn attr(&self, name: DwAt) -> Option<&Attribute<'d>> {
        self.attributes.get(&name)
    }

    /// Returns the translated value of an attribute.
    pub fn attr_value(&self, name: DwAt) -> Option<AttributeValue<'d>> {
        self.attr(name).map(|attr| attr.value)
    }

    /// Iterates over all attributes in encoding order.
    pub fn attributes(&self) -> impl ExactSizeIterator<Item = &Attribute<'d>> {
        self.attributes.values()
    }
}

impl fmt::Debug for Die<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Die")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("tag", &self.tag)
            .field("has_children", &self.has_children)
            .field("attributes", &self.attributes.values().collect::<Vec<_>>())
            .finish()
    }
}

/// Follows a chain of `DW_FORM_indirect` codes and reads the value of the final form.
fn read_indirect<'d>(
    reader: &mut Reader<'d>,
    ctx: SchemaContext,
) -> Result<(Form, RawValue<'d>, u32)> {
    let mut depth = 1;
    loop {
        let code_offset = reader.position();
        let code = reader.uleb128()?;
        match Form::from_code(code) {
            Some(Form::Indirect) => depth += 1,
            Some(Form::ImplicitConst) => {
                return Err(DwarfError::malformed(
                    code_offset,
                    "implicit constant selected by DW_FORM_indirect",
                ))
            }
            Some(form) => return Ok((form, form.read(reader, ctx)?, depth)),
            None => {
                return Err(DwarfError::UnknownForm {
                    offset: code_offset,
                    form: code,
                })
            }
        }
    }
}

fn missing_base(unit: UnitRef<'_, '_>, attribute: &'static str) -> DwarfError {
    DwarfError::MissingBase {
        unit_offset: unit.unit.offset(),
        attribute,
    }
}

/// Translates a raw attribute value according to its form.
fn translate<'d>(
    unit: UnitRef<'d, '_>,
    bases: Option<&UnitBases>,
    form: Form,
    raw: RawValue<'d>,
) -> Result<AttributeValue<'d>> {
    let info = unit.info;
    let value = match raw {
        RawValue::Signed(value) => return Ok(AttributeValue::Signed(value)),
        RawValue::Block(bytes) => return Ok(AttributeValue::Block(bytes)),
        RawValue::String(bytes) => return Ok(AttributeValue::String(bytes)),
        RawValue::Unsigned(value) => value,
    };

    let translated = match form {
        Form::Strp => AttributeValue::String(info.string_at(value)?),
        Form::LineStrp => AttributeValue::String(info.line_string_at(value)?),
        Form::StrpSup | Form::GnuStrpAlt => match info.supplementary() {
            Some(sup) => AttributeValue::String(sup.string_at(value)?),
            None => AttributeValue::Unsigned(value),
        },
        Form::Flag | Form::FlagPresent => AttributeValue::Flag(value != 0),
        Form::Addr => AttributeValue::Address(value),
        Form::SecOffset => AttributeValue::SecOffset(value),
        _ if !form.is_indexed() => AttributeValue::Unsigned(value),

        // Indexed forms of the root DIE are resolved after the whole entry is parsed.
        _ => match bases {
            None => AttributeValue::Unsigned(value),
            Some(bases) => translate_index(unit, bases, form, value)?,
        },
    };

    Ok(translated)
}

fn translate_index<'d>(
    unit: UnitRef<'d, '_>,
    bases: &UnitBases,
    form: Form,
    index: u64,
) -> Result<AttributeValue<'d>> {
    let info = unit.info;
    let ctx = unit.unit.ctx();

    Ok(match form {
        Form::GnuAddrIndex
        | Form::Addrx
        | Form::Addrx1
        | Form::Addrx2
        | Form::Addrx3
        | Form::Addrx4 => {
            let base = bases
                .addr_base
                .ok_or_else(|| missing_base(unit, "DW_AT_addr_base"))?;
            AttributeValue::Address(info.read_addr(ctx, base, index)?)
        }
        Form::GnuStrIndex => {
            let base = bases.str_offsets_base.unwrap_or(0);
            AttributeValue::String(info.read_indexed_string(ctx, base, index)?)
        }
        Form::Loclistx => {
            let base = bases
                .loclists_base
                .ok_or_else(|| missing_base(unit, "DW_AT_loclists_base"))?;
            let data = info.loclists_data()?;
            let relative = info.read_offset_entry(data, ctx, base, index)?;
            AttributeValue::SecOffset(list_offset(base, relative)?)
        }
        Form::Rnglistx => {
            let base = bases
                .rnglists_base
                .ok_or_else(|| missing_base(unit, "DW_AT_rnglists_base"))?;
            let data = info.rnglists_data()?;
            let relative = info.read_offset_entry(data, ctx, base, index)?;
            AttributeValue::SecOffset(list_offset(base, relative)?)
        }
        _ => {
            let base = bases
                .str_offsets_base
                .ok_or_else(|| missing_base(unit, "DW_AT_str_offsets_base"))?;
            AttributeValue::String(info.read_indexed_string(ctx, base, index)?)
        }
    })
}

/// Offsets in the list offset table are relative to the unit's list base.
fn list_offset(base: u64, relative: u64) -> Result<u64> {
    base.checked_add(relative).ok_or(DwarfError::DanglingReference {
        offset: base,
        target: relative,
    })
}

/// A DIE along with the unit it belongs to.
///
/// This is the handle through which the tree is navigated. Dereferences to [`Die`].
#[derive(Clone, Copy)]
pub struct DieRef<'d, 'a> {
    unit: UnitRef<'d, 'a>,
    die: &'a Die<'d>,
}

impl<'d, 'a> DieRef<'d, 'a> {
    pub(crate) fn new(unit: UnitRef<'d, 'a>, die: &'a Die<'d>) -> Self {
        DieRef { unit, die }
    }

    /// The unit containing this DIE.
    pub fn unit(&self) -> UnitRef<'d, 'a> {
        self.unit
    }

    /// The DIE itself.
    pub fn die(&self) -> &'a Die<'d> {
        self.die
    }

    /// Iterates over the children of this DIE, not including the null entry that terminates them.
    pub fn children(&self) -> DieChildren<'d, 'a> {
        let state = if self.die.has_children {
            ChildState::At(self.die.offset + self.die.size)
        } else {
            ChildState::Done
        };

        DieChildren {
            parent: *self,
            state,
        }
    }

    /// The null entry terminating the list of children.
    ///
    /// Returns `None` for DIEs without children. Enumerates the children if the terminator has
    /// not been located yet.
    pub fn terminator(&self) -> Result<Option<DieRef<'d, 'a>>> {
        if !self.die.has_children {
            return Ok(None);
        }

        if self.die.terminator.get().is_none() {
            for child in self.children() {
                child?;
            }
        }

        match self.die.terminator.get() {
            Some(offset) => self.unit.die_at(offset).map(Some),
            None => Err(DwarfError::malformed(self.die.offset, "children not terminated")),
        }
    }

    /// Section offset of the entry following this DIE and its children.
    fn next_sibling_offset(&self) -> Result<u64> {
        let after = self.die.offset + self.die.size;
        if !self.die.has_children {
            return Ok(after);
        }

        if let Some(sibling) = self.die.attr(constants::DW_AT_sibling) {
            let target = match (sibling.form, sibling.raw) {
                (Form::RefAddr, RawValue::Unsigned(value)) => Some(value),
                (form, RawValue::Unsigned(value)) if form.is_reference() && form != Form::RefSig8 => {
                    self.unit.unit.offset().checked_add(value)
                }
                (form, _) => {
                    return Err(DwarfError::UnsupportedForm {
                        offset: sibling.offset,
                        form: form.dw(),
                    })
                }
            };

            // The sibling must lie past this entry and inside the unit.
            return match target {
                Some(target) if target > after && target < self.unit.unit.end() => Ok(target),
                _ => Err(DwarfError::malformed(
                    sibling.offset,
                    format!("DW_AT_sibling of DIE at {:#x} does not advance", self.die.offset),
                )),
            };
        }

        match self.terminator()? {
            Some(terminator) => Ok(terminator.offset() + terminator.size()),
            None => Ok(after),
        }
    }

    /// Returns the parent of this DIE, or `None` for the unit's root DIE.
    ///
    /// The parent is located by descending from the root. At each level, the child with the
    /// greatest offset not exceeding this DIE's offset is the next ancestor.
    pub fn parent(&self) -> Result<Option<DieRef<'d, 'a>>> {
        if let Some(parent) = self.die.parent.get() {
            return self.unit.die_at(parent).map(Some);
        }

        let root = self.unit.root()?;
        if root.offset() == self.offset() {
            return Ok(None);
        }

        let target = self.die.offset;
        let mut search = root;
        while search.offset() < target {
            let mut next = search;
            for child in search.children() {
                let child = child?;
                if child.offset() <= target {
                    next = child;
                }
            }

            if let Some(terminator) = search.terminator()? {
                if terminator.offset() <= target {
                    next = terminator;
                }
            }

            if next.offset() == search.offset() {
                return Err(DwarfError::malformed(
                    target,
                    format!(
                        "offset not in DIE tree of unit at {:#x}",
                        self.unit.unit.offset()
                    ),
                ));
            }

            search = next;
        }

        match self.die.parent.get() {
            Some(parent) => self.unit.die_at(parent).map(Some),
            None => Err(DwarfError::malformed(target, "parent not found")),
        }
    }

    /// Iterates over the other children of this DIE's parent.
    ///
    /// The root DIE has no siblings.
    pub fn siblings(&self) -> Result<DieSiblings<'d, 'a>> {
        Ok(DieSiblings {
            children: self.parent()?.map(|parent| parent.children()),
            offset: self.die.offset,
        })
    }

    /// Returns the DIE referenced by an attribute of the reference class.
    ///
    /// Returns `Ok(None)` if the DIE has no such attribute. References into type units by
    /// signature are not supported, and references into a supplementary file require one to be
    /// attached with [`DwarfInfo::with_supplementary`](crate::DwarfInfo::with_supplementary).
    pub fn resolve_reference(&self, name: DwAt) -> Result<Option<DieRef<'d, 'a>>> {
        let attr = match self.die.attr(name) {
            Some(attr) => attr,
            None => return Ok(None),
        };

        let target = attr.raw.as_u64().unwrap_or_default();

        let resolved = match attr.form {
            Form::Ref1 | Form::Ref2 | Form::Ref4 | Form::Ref8 | Form::RefUdata => {
                match self.unit.unit.offset().checked_add(target) {
                    Some(target) => self.unit.die_at(target),
                    None => Err(DwarfError::DanglingReference {
                        offset: attr.offset,
                        target,
                    }),
                }
            }
            Form::RefAddr => self.unit.info.die_at(target),
            Form::RefSup4 | Form::RefSup8 | Form::GnuRefAlt => {
                match self.unit.info.supplementary() {
                    Some(sup) => sup.die_at(target),
                    None => Err(DwarfError::UnsupportedForm {
                        offset: attr.offset,
                        form: attr.form.dw(),
                    }),
                }
            }
            Form::RefSig8 => Err(DwarfError::UnsupportedForm {
                offset: attr.offset,
                form: attr.form.dw(),
            }),
            form => Err(DwarfError::malformed(
                attr.offset,
                format!("{} has non-reference form {form}", attr.name),
            )),
        };

        resolved.map(Some).map_err(|error| match error {
            DwarfError::DanglingReference { target, .. } => DwarfError::DanglingReference {
                offset: attr.offset,
                target,
            },
            error => error,
        })
    }

    /// Joins `DW_AT_comp_dir` and `DW_AT_name`, either of which may be missing.
    pub fn full_path(&self) -> PathBuf {
        let string = |name| {
            self.die
                .attr_value(name)
                .and_then(|value| value.as_str())
                .unwrap_or_default()
        };

        let comp_dir = string(constants::DW_AT_comp_dir);
        let name = string(constants::DW_AT_name);
        PathBuf::from(&*comp_dir).join(&*name)
    }
}

impl<'d> std::ops::Deref for DieRef<'d, '_> {
    type Target = Die<'d>;

    fn deref(&self) -> &Self::Target {
        self.die
    }
}

impl fmt::Debug for DieRef<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.die, f)
    }
}

#[derive(Clone, Copy, Debug)]
enum ChildState<'d, 'a> {
    /// The next child starts at this offset.
    At(u64),
    /// The next child follows this one and its subtree.
    After(DieRef<'d, 'a>),
    Done,
}

/// An iterator over the children of a DIE.
///
/// A child carrying `DW_AT_sibling` lets the iterator jump directly to the next child. Otherwise
/// the child's subtree is enumerated to find its end, and the location of its terminator is
/// cached on the child.
#[derive(Clone, Debug)]
pub struct DieChildren<'d, 'a> {
    parent: DieRef<'d, 'a>,
    state: ChildState<'d, 'a>,
}

impl<'d, 'a> DieChildren<'d, 'a> {
    /// The DIE whose children are enumerated.
    pub fn parent(&self) -> DieRef<'d, 'a> {
        self.parent
    }

    fn advance(&mut self) -> Result<Option<DieRef<'d, 'a>>> {
        let offset = match self.state {
            ChildState::At(offset) => offset,
            ChildState::After(child) => child.next_sibling_offset()?,
            ChildState::Done => return Ok(None),
        };

        let child = self.parent.unit.die_at(offset)?;
        child.die.parent.set(Some(self.parent.offset()));

        if child.is_null() {
            self.parent.die.terminator.set(Some(offset));
            self.state = ChildState::Done;
            return Ok(None);
        }

        self.state = ChildState::After(child);
        Ok(Some(child))
    }
}

impl<'d, 'a> Iterator for DieChildren<'d, 'a> {
    type Item = Result<DieRef<'d, 'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(child) => child.map(Ok),
            Err(error) => {
                self.state = ChildState::Done;
                Some(Err(error))
            }
        }
    }
}

impl std::iter::FusedIterator for DieChildren<'_, '_> {}

/// An iterator over the siblings of a DIE, excluding the DIE itself.
#[derive(Clone, Debug)]
pub struct DieSiblings<'d, 'a> {
    children: Option<DieChildren<'d, 'a>>,
    offset: u64,
}

impl<'d, 'a> Iterator for DieSiblings<'d, 'a> {
    type Item = Result<DieRef<'d, 'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        self.children
            .as_mut()?
            .find(|child| !matches!(child, Ok(child) if child.offset() == offset))
    }
}

impl std::iter::FusedIterator for DieSiblings<'_, '_> {}

/// A depth-first iterator over a DIE and its subtree, in document order.
///
/// Null entries terminating lists of children are included. A `DW_TAG_imported_unit` is
/// replaced by the unit it imports when a supplementary file is attached.
#[derive(Debug)]
pub struct DieTree<'d, 'a> {
    pending: Option<Result<DieRef<'d, 'a>>>,
    stack: Vec<DieChildren<'d, 'a>>,
}

impl<'d, 'a> DieTree<'d, 'a> {
    pub(crate) fn new(root: Result<DieRef<'d, 'a>>) -> Self {
        DieTree {
            pending: Some(root),
            stack: Vec::new(),
        }
    }

    fn enter(&mut self, die: DieRef<'d, 'a>) -> Result<DieRef<'d, 'a>> {
        let mut die = die;
        if die.tag() == Some(constants::DW_TAG_imported_unit)
            && die.unit.info.supplementary().is_some()
        {
            if let Some(imported) = die.resolve_reference(constants::DW_AT_import)? {
                die = imported;
            }
        }

        if die.has_children() {
            self.stack.push(die.children());
        }

        Ok(die)
    }

    fn advance(&mut self) -> Result<Option<DieRef<'d, 'a>>> {
        if let Some(pending) = self.pending.take() {
            return self.enter(pending?).map(Some);
        }

        let children = match self.stack.last_mut() {
            Some(children) => children,
            None => return Ok(None),
        };

        match children.next().transpose()? {
            Some(child) => self.enter(child).map(Some),
            None => {
                let parent = children.parent();
                self.stack.pop();
                parent.terminator()
            }
        }
    }
}

impl<'d, 'a> Iterator for DieTree<'d, 'a> {
    type Item = Result<DieRef<'d, 'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(die) => die.map(Ok),
            Err(error) => {
                self.stack.clear();
                Some(Err(error))
            }
        }
    }
}

impl std::iter::FusedIterator for DieTree<'_, '_> {}
