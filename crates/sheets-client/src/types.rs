use serde::{Deserialize, Serialize};

/// Spreadsheet metadata from the `spreadsheets.get` endpoint, trimmed to the
/// sheet list.
#[derive(Debug, Clone, Deserialize)]
pub struct Spreadsheet {
    #[serde(default)]
    pub sheets: Vec<Sheet>,
}

/// One tab of a spreadsheet.
#[derive(Debug, Clone, Deserialize)]
pub struct Sheet {
    pub properties: SheetProperties,
}

/// Tab properties as the API reports them.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetProperties {
    #[serde(rename = "sheetId")]
    pub sheet_id: i64,
    pub title: String,
}

/// Properties for a tab being created.
#[derive(Debug, Clone, Serialize)]
pub struct NewSheetProperties {
    pub title: String,
    #[serde(rename = "gridProperties")]
    pub grid_properties: GridProperties,
}

/// Grid dimensions for a new tab.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GridProperties {
    #[serde(rename = "rowCount")]
    pub row_count: u32,
    #[serde(rename = "columnCount")]
    pub column_count: u32,
}

/// Envelope for the `spreadsheets.batchUpdate` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BatchUpdateRequest {
    pub requests: Vec<SheetRequest>,
}

/// One mutation inside a `batchUpdate` call. Exactly one field is set.
#[derive(Debug, Clone, Serialize)]
pub struct SheetRequest {
    #[serde(rename = "addSheet", skip_serializing_if = "Option::is_none")]
    pub add_sheet: Option<AddSheetRequest>,
    #[serde(rename = "deleteSheet", skip_serializing_if = "Option::is_none")]
    pub delete_sheet: Option<DeleteSheetRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddSheetRequest {
    pub properties: NewSheetProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteSheetRequest {
    #[serde(rename = "sheetId")]
    pub sheet_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchUpdateResponse {
    #[serde(default)]
    pub replies: Vec<SheetReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SheetReply {
    #[serde(rename = "addSheet")]
    pub add_sheet: Option<AddSheetReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddSheetReply {
    pub properties: SheetProperties,
}

/// A rectangular block of cell values for the `values.update` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRange {
    pub range: String,
    #[serde(rename = "majorDimension")]
    pub major_dimension: String,
    pub values: Vec<Vec<String>>,
}

/// Confirmation counts from a `values.update` call.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpdateValuesResponse {
    #[serde(rename = "updatedRows", default)]
    pub updated_rows: u32,
    #[serde(rename = "updatedColumns", default)]
    pub updated_columns: u32,
    #[serde(rename = "updatedCells", default)]
    pub updated_cells: u32,
}
