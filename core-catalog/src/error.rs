use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Incompatible schema for table {table}: {message}")]
    Schema { table: String, message: String },

    #[error("Catalog write failed for {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Catalog read failed for {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database error: {0}")]
    Connection(#[from] sqlx::Error),
}

impl CatalogError {
    pub(crate) fn write(key: impl ToString) -> impl FnOnce(sqlx::Error) -> Self {
        let key = key.to_string();
        move |source| CatalogError::Write { key, source }
    }

    pub(crate) fn read(key: impl ToString) -> impl FnOnce(sqlx::Error) -> Self {
        let key = key.to_string();
        move |source| CatalogError::Read { key, source }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
