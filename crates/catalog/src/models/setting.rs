#[derive(sqlx::FromRow)]
pub(crate) struct SettingRow {
    pub(crate) value: String,
}
