pub mod error;
pub mod types;

pub use error::{Result, SheetsError};
pub use types::{
    AddSheetRequest, BatchUpdateRequest, BatchUpdateResponse, DeleteSheetRequest, GridProperties,
    NewSheetProperties, SheetProperties, SheetRequest, Spreadsheet, UpdateValuesResponse,
    ValueRange,
};

pub const CRATE_NAME: &str = "sheets-client";

const BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

pub struct SheetsClient {
    client: reqwest::Client,
    token: String,
}

impl SheetsClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Fetch the sheet list for a spreadsheet.
    pub async fn get_spreadsheet(&self, spreadsheet_id: &str) -> Result<Spreadsheet> {
        let url = format!("{}/{}?fields=sheets.properties", BASE_URL, spreadsheet_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let spreadsheet: Spreadsheet = resp.json().await?;
        Ok(spreadsheet)
    }

    /// Resolve a tab title to its numeric sheet id, if the tab exists.
    pub async fn find_sheet_id(&self, spreadsheet_id: &str, title: &str) -> Result<Option<i64>> {
        let spreadsheet = self.get_spreadsheet(spreadsheet_id).await?;
        Ok(spreadsheet
            .sheets
            .iter()
            .find(|sheet| sheet.properties.title == title)
            .map(|sheet| sheet.properties.sheet_id))
    }

    /// Delete one tab by its numeric sheet id.
    pub async fn delete_sheet(&self, spreadsheet_id: &str, sheet_id: i64) -> Result<()> {
        tracing::info!(spreadsheet_id, sheet_id, "Deleting sheet tab");
        let request = BatchUpdateRequest {
            requests: vec![SheetRequest {
                add_sheet: None,
                delete_sheet: Some(DeleteSheetRequest { sheet_id }),
            }],
        };
        self.batch_update(spreadsheet_id, &request).await?;
        Ok(())
    }

    /// Create a tab sized to the given grid. Returns the new tab's properties.
    pub async fn add_sheet(
        &self,
        spreadsheet_id: &str,
        title: &str,
        rows: u32,
        cols: u32,
    ) -> Result<SheetProperties> {
        tracing::info!(spreadsheet_id, title, rows, cols, "Creating sheet tab");
        let request = BatchUpdateRequest {
            requests: vec![SheetRequest {
                add_sheet: Some(AddSheetRequest {
                    properties: NewSheetProperties {
                        title: title.to_string(),
                        grid_properties: GridProperties {
                            row_count: rows,
                            column_count: cols,
                        },
                    },
                }),
                delete_sheet: None,
            }],
        };
        let response = self.batch_update(spreadsheet_id, &request).await?;
        response
            .replies
            .into_iter()
            .find_map(|reply| reply.add_sheet)
            .map(|reply| reply.properties)
            .ok_or_else(|| {
                SheetsError::Parse("batchUpdate reply missing addSheet properties".to_string())
            })
    }

    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        request: &BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse> {
        let url = format!("{}/{}:batchUpdate", BASE_URL, spreadsheet_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let response: BatchUpdateResponse = resp.json().await?;
        Ok(response)
    }

    /// Overwrite a cell range with raw, unparsed values.
    pub async fn update_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<UpdateValuesResponse> {
        let body = ValueRange {
            range: range.to_string(),
            major_dimension: "ROWS".to_string(),
            values,
        };

        let url = format!(
            "{}/{}/values/{}?valueInputOption=RAW",
            BASE_URL, spreadsheet_id, range
        );
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let response: UpdateValuesResponse = resp.json().await?;
        tracing::info!(
            spreadsheet_id,
            range,
            cells = response.updated_cells,
            "Updated sheet values"
        );
        Ok(response)
    }
}
