//! Spreadsheet report: one worksheet per product family.

use std::path::{Path, PathBuf};

use rbcn_core::{CategoryGroups, ProductDirectory, ProductListing, F_CLASS};
use rust_xlsxwriter::{Format, FormatAlign, Workbook, XlsxError};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_OUTPUT_PATH: &str = "funds_data.xlsx";

pub const FUND_NAME_HEADER: &str = "Fund name";
pub const ISSUED_DATE_HEADER: &str = "Issued Date";
pub const MATURITY_DATE_HEADER: &str = "Maturity Date";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no categories to export; a workbook needs at least one sheet")]
    NoCategories,
    #[error("writing {}: {source}", path.display())]
    Xlsx {
        path: PathBuf,
        #[source]
        source: XlsxError,
    },
}

/// Cell contents of one worksheet, before any xlsx formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub name: String,
    pub banner: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetLayout {
    pub fn column_count(&self) -> usize {
        self.header.len()
    }
}

/// A category member whose reference labels differ from the first member's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub category: String,
    pub product: String,
    /// Header labels this product does not have; exported as empty cells.
    pub missing: Vec<String>,
    /// Labels this product has that the header lacks; not exported.
    pub extra: Vec<String>,
}

fn members<'a>(
    directory: &'a ProductDirectory,
    names: &'a [String],
) -> impl Iterator<Item = &'a ProductListing> + 'a {
    names.iter().filter_map(|name| directory.get(name))
}

/// The header's reference labels come from the first member of the category.
pub fn sheet_layouts(groups: &CategoryGroups, directory: &ProductDirectory) -> Vec<SheetLayout> {
    groups
        .iter()
        .enumerate()
        .map(|(index, (category, names))| {
            let labels = members(directory, names)
                .next()
                .map(|first| first.reference_labels())
                .unwrap_or_default();

            let mut header = vec![FUND_NAME_HEADER.to_string()];
            header.extend(labels.iter().map(|label| label.to_string()));
            header.extend([F_CLASS, ISSUED_DATE_HEADER, MATURITY_DATE_HEADER].map(String::from));

            let rows = members(directory, names)
                .map(|listing| {
                    let mut row = vec![listing.name.clone()];
                    row.extend(labels.iter().map(|label| listing.reference_value(label).to_string()));
                    row.push(if listing.is_f_class() { F_CLASS.to_string() } else { String::new() });
                    row.push(listing.issue_date.clone());
                    row.push(listing.maturity_date.clone());
                    row
                })
                .collect();

            SheetLayout {
                name: (index + 1).to_string(),
                banner: category.to_string(),
                header,
                rows,
            }
        })
        .collect()
}

pub fn schema_mismatches(groups: &CategoryGroups, directory: &ProductDirectory) -> Vec<SchemaMismatch> {
    let mut mismatches = Vec::new();
    for (category, names) in groups.iter() {
        let mut listings = members(directory, names);
        let Some(first) = listings.next() else {
            continue;
        };
        let expected = first.reference_labels();
        for listing in listings {
            let actual = listing.reference_labels();
            let missing = expected
                .iter()
                .filter(|label| !actual.contains(*label))
                .map(|label| label.to_string())
                .collect::<Vec<_>>();
            let extra = actual
                .iter()
                .filter(|label| !expected.contains(*label))
                .map(|label| label.to_string())
                .collect::<Vec<_>>();
            if !missing.is_empty() || !extra.is_empty() {
                mismatches.push(SchemaMismatch {
                    category: category.to_string(),
                    product: listing.name.clone(),
                    missing,
                    extra,
                });
            }
        }
    }
    mismatches
}

/// Writes the sheets to `path`, replacing any existing file.
pub fn write_workbook(layouts: &[SheetLayout], path: &Path) -> Result<(), ExportError> {
    if layouts.is_empty() {
        return Err(ExportError::NoCategories);
    }
    let xlsx_err = |source: XlsxError| ExportError::Xlsx {
        path: path.to_path_buf(),
        source,
    };

    let banner_format = Format::new().set_bold().set_align(FormatAlign::Center);
    let mut workbook = Workbook::new();
    for layout in layouts {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&layout.name).map_err(xlsx_err)?;

        let last_col = layout.column_count().saturating_sub(1) as u16;
        if last_col > 0 {
            worksheet
                .merge_range(0, 0, 0, last_col, &layout.banner, &banner_format)
                .map_err(xlsx_err)?;
        } else {
            worksheet
                .write_string_with_format(0, 0, &layout.banner, &banner_format)
                .map_err(xlsx_err)?;
        }

        for (col, title) in layout.header.iter().enumerate() {
            worksheet.write_string(1, col as u16, title).map_err(xlsx_err)?;
        }
        for (row_index, row) in layout.rows.iter().enumerate() {
            for (col, value) in row.iter().enumerate() {
                worksheet
                    .write_string(row_index as u32 + 2, col as u16, value)
                    .map_err(xlsx_err)?;
            }
        }
    }
    workbook.save(path).map_err(xlsx_err)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub sheets: usize,
    pub products: usize,
}

pub fn export_report(
    groups: &CategoryGroups,
    directory: &ProductDirectory,
    path: &Path,
) -> Result<ExportSummary, ExportError> {
    for mismatch in schema_mismatches(groups, directory) {
        warn!(
            category = %mismatch.category,
            product = %mismatch.product,
            missing = ?mismatch.missing,
            extra = ?mismatch.extra,
            "reference labels differ from the first product in the category; header follows the first product"
        );
    }

    let layouts = sheet_layouts(groups, directory);
    write_workbook(&layouts, path)?;
    let summary = ExportSummary {
        path: path.to_path_buf(),
        sheets: layouts.len(),
        products: layouts.iter().map(|l| l.rows.len()).sum(),
    };
    info!(path = %path.display(), sheets = summary.sheets, products = summary.products, "report written");
    Ok(summary)
}
