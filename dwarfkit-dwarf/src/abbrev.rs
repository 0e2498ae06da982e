//! Abbreviation tables from `.debug_abbrev`.

use std::collections::BTreeMap;

use gimli::constants::{self, DwAt, DwTag};
use smallvec::SmallVec;

use crate::error::{DwarfError, Result};
use crate::form::Form;
use crate::reader::Reader;
use crate::Endian;

/// One attribute of an abbreviation declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeSpec {
    /// The attribute name.
    pub name: DwAt,
    /// The declared form code.
    pub form_code: u64,
    /// How the value is encoded in each DIE, or `None` if the form code is unknown.
    ///
    /// An unknown form only fails when a DIE using this declaration is read.
    pub form: Option<Form>,
    /// The value of a `DW_FORM_implicit_const` attribute, stored in the declaration itself.
    pub implicit_const: Option<i64>,
}

/// The shape shared by all DIEs that use the same abbreviation code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbbrevDecl {
    /// The abbreviation code.
    pub code: u64,
    /// The tag of DIEs using this declaration.
    pub tag: DwTag,
    /// Whether DIEs using this declaration are followed by a list of children.
    pub has_children: bool,
    /// Attribute specifications in encoding order.
    pub attributes: SmallVec<[AttributeSpec; 8]>,
}

impl AbbrevDecl {
    /// Whether the declaration contains an attribute with the given name.
    pub fn has_attribute(&self, name: DwAt) -> bool {
        self.attributes.iter().any(|spec| spec.name == name)
    }
}

/// An abbreviation table, mapping codes to declarations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbbrevTable {
    offset: u64,
    decls: BTreeMap<u64, AbbrevDecl>,
}

impl AbbrevTable {
    /// Parses the table starting at `offset` of the `.debug_abbrev` section.
    ///
    /// The table ends at the first null abbreviation code or at the end of the section.
    #[tracing::instrument(level = "trace", name = "AbbrevTable::parse", skip_all, fields(offset = offset))]
    pub fn parse(data: &[u8], offset: u64, endian: Endian) -> Result<Self> {
        let mut reader = Reader::at(data, offset, endian);
        let mut decls = BTreeMap::new();

        while !reader.is_empty() {
            let code = reader.uleb128()?;
            if code == 0 {
                break;
            }

            let tag_offset = reader.position();
            let tag = DwTag(narrow(reader.uleb128()?, tag_offset, "tag")?);
            let has_children = reader.u8()? == constants::DW_CHILDREN_yes.0;

            let mut attributes = SmallVec::new();
            loop {
                let spec_offset = reader.position();
                let name = reader.uleb128()?;
                let form = reader.uleb128()?;
                if name == 0 && form == 0 {
                    break;
                }

                let name = DwAt(narrow(name, spec_offset, "attribute name")?);
                let form_code = form;
                let form = Form::from_code(form_code);
                let implicit_const = match form {
                    Some(Form::ImplicitConst) => Some(reader.sleb128()?),
                    Some(_) => None,
                    None => {
                        tracing::debug!(offset = spec_offset, form_code, "unknown attribute form");
                        None
                    }
                };

                attributes.push(AttributeSpec {
                    name,
                    form_code,
                    form,
                    implicit_const,
                });
            }

            let decl = AbbrevDecl {
                code,
                tag,
                has_children,
                attributes,
            };

            if decls.insert(code, decl).is_some() {
                tracing::debug!(offset, code, "duplicate abbreviation code");
            }
        }

        Ok(AbbrevTable { offset, decls })
    }

    /// Section offset of the table.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the declaration for an abbreviation code.
    pub fn get(&self, code: u64) -> Option<&AbbrevDecl> {
        self.decls.get(&code)
    }

    /// Number of declarations in the table.
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    /// Whether the table declares no abbreviations.
    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Iterates over the declarations in code order.
    pub fn iter(&self) -> impl Iterator<Item = &AbbrevDecl> {
        self.decls.values()
    }
}

fn narrow(value: u64, offset: u64, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| DwarfError::malformed(offset, format!("{what} {value:#x} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use dwarfkit_testutils::SectionWriter;
    use similar_asserts::assert_eq;

    #[test]
    fn test_parse_table() -> Result<()> {
        let mut w = SectionWriter::little();
        w.zeros(3);
        w.uleb(1).uleb(0x2e).u8(1);
        w.uleb(0x03).uleb(0x0e);
        w.uleb(0x3e).uleb(0x21).sleb(-7);
        w.uleb(0).uleb(0);
        w.uleb(2).uleb(0x24).u8(0);
        w.uleb(0).uleb(0);
        w.uleb(0);

        let data = w.finish();
        let table = AbbrevTable::parse(&data, 3, Endian::Little)?;
        assert_eq!(table.len(), 2);

        let decl = table.get(1).unwrap();
        assert_eq!(decl.tag, constants::DW_TAG_subprogram);
        assert!(decl.has_children);
        assert_eq!(
            decl.attributes.as_slice(),
            &[
                AttributeSpec {
                    name: constants::DW_AT_name,
                    form_code: 0x0e,
                    form: Some(Form::Strp),
                    implicit_const: None,
                },
                AttributeSpec {
                    name: constants::DW_AT_encoding,
                    form_code: 0x21,
                    form: Some(Form::ImplicitConst),
                    implicit_const: Some(-7),
                },
            ]
        );

        let decl = table.get(2).unwrap();
        assert_eq!(decl.tag, constants::DW_TAG_base_type);
        assert!(!decl.has_children);
        assert!(decl.attributes.is_empty());
        assert!(table.get(3).is_none());
        Ok(())
    }

    #[test]
    fn test_unknown_form() -> Result<()> {
        let mut w = SectionWriter::little();
        w.uleb(1).uleb(0x11).u8(0);
        w.uleb(0x03).uleb(0x02);
        w.uleb(0x0b).uleb(0x0b);
        w.uleb(0).uleb(0);
        w.uleb(2).uleb(0x24).u8(0);
        w.uleb(0).uleb(0);
        w.uleb(0);

        let data = w.finish();
        let table = AbbrevTable::parse(&data, 0, Endian::Little)?;
        assert_eq!(table.len(), 2);

        let decl = table.get(1).unwrap();
        assert_eq!(decl.attributes.len(), 2);
        assert_eq!(decl.attributes[0].form_code, 2);
        assert_eq!(decl.attributes[0].form, None);
        assert_eq!(decl.attributes[1].form, Some(Form::Data1));
        assert!(table.get(2).is_some());
        Ok(())
    }
}
