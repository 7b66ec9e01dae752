// Token re-issuance DTOs for `POST /api/v1/users/reissue`.

use serde::{Deserialize, Serialize};

pub const REISSUE_PATH: &str = "/api/v1/users/reissue";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenReissueRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenReissueResponse {
    pub access_token: String,
    pub refresh_token: String,
}
