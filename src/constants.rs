/// Column names, table names and formats shared across the pipeline stages.
/// These are the built-in defaults; `PipelineConfig` can override every list.

// Source columns
pub const COL_TRANS_TIME: &str = "trans_date_trans_time";
pub const COL_CC_NUM: &str = "cc_num";
pub const COL_MERCHANT: &str = "merchant";
pub const COL_CATEGORY: &str = "category";
pub const COL_AMOUNT: &str = "amt";
pub const COL_FIRST: &str = "first";
pub const COL_LAST: &str = "last";
pub const COL_GENDER: &str = "gender";
pub const COL_STREET: &str = "street";
pub const COL_CITY: &str = "city";
pub const COL_STATE: &str = "state";
pub const COL_ZIP: &str = "zip";
pub const COL_LAT: &str = "lat";
pub const COL_LONG: &str = "long";
pub const COL_CITY_POP: &str = "city_pop";
pub const COL_JOB: &str = "job";
pub const COL_DOB: &str = "dob";
pub const COL_TRANS_NUM: &str = "trans_num";
pub const COL_UNIX_TIME: &str = "unix_time";
pub const COL_MERCH_LAT: &str = "merch_lat";
pub const COL_MERCH_LONG: &str = "merch_long";
pub const COL_IS_FRAUD: &str = "is_fraud";

// Derived columns
pub const COL_TRANS_MONTH: &str = "trans_month";
pub const COL_TRANS_DAY: &str = "trans_day";
pub const COL_TRANS_HOUR: &str = "trans_hour";
pub const COL_AGE: &str = "age";
pub const COL_RECORD_KEY: &str = "record_key";

// Warehouse-only provenance columns
pub const COL_RUN_ID: &str = "run_id";
pub const COL_MERGED_AT: &str = "merged_at";

// Default table names
pub const RAW_TABLE: &str = "transactions_raw";
pub const STAGING_TABLE: &str = "transactions_staging";
pub const WAREHOUSE_TABLE: &str = "transactions_processed";
pub const ENCODINGS_TABLE: &str = "label_encodings";

pub const TRANS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DOB_FORMATS: &[&str] = &["%Y-%m-%d", "%Y-%m-%d %H:%M:%S"];

pub const DAYS_PER_YEAR: i64 = 365;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Every column a source extract must carry.
pub const RAW_COLUMNS: &[&str] = &[
    COL_TRANS_TIME,
    COL_CC_NUM,
    COL_MERCHANT,
    COL_CATEGORY,
    COL_AMOUNT,
    COL_FIRST,
    COL_LAST,
    COL_GENDER,
    COL_STREET,
    COL_CITY,
    COL_STATE,
    COL_ZIP,
    COL_LAT,
    COL_LONG,
    COL_CITY_POP,
    COL_JOB,
    COL_DOB,
    COL_TRANS_NUM,
    COL_UNIX_TIME,
    COL_MERCH_LAT,
    COL_MERCH_LONG,
    COL_IS_FRAUD,
];

/// Identifier-like columns that are always stored as text.
pub const TEXT_COLUMNS: &[&str] = &[COL_CC_NUM, COL_TRANS_NUM];

/// PII and irrelevant columns removed before staging.
pub const DROP_COLUMNS: &[&str] = &[
    COL_CC_NUM,
    COL_FIRST,
    COL_LAST,
    COL_TRANS_NUM,
    COL_UNIX_TIME,
    COL_MERCHANT,
];

pub const ENCODE_COLUMNS: &[&str] = &[
    COL_CATEGORY,
    COL_STREET,
    COL_CITY,
    COL_STATE,
    COL_JOB,
    COL_GENDER,
];

/// Source fields hashed into the natural key.
pub const KEY_COLUMNS: &[&str] = &[COL_CC_NUM, COL_TRANS_TIME, COL_AMOUNT];

/// Columns the warehouse accumulates, in insert order.
pub const WAREHOUSE_COLUMNS: &[&str] = &[
    COL_CATEGORY,
    COL_AMOUNT,
    COL_GENDER,
    COL_STREET,
    COL_CITY,
    COL_STATE,
    COL_ZIP,
    COL_LAT,
    COL_LONG,
    COL_CITY_POP,
    COL_JOB,
    COL_MERCH_LAT,
    COL_MERCH_LONG,
    COL_TRANS_MONTH,
    COL_TRANS_DAY,
    COL_TRANS_HOUR,
    COL_AGE,
    COL_IS_FRAUD,
];

/// Numeric columns declared REAL in the warehouse.
pub const REAL_COLUMNS: &[&str] = &[COL_AMOUNT, COL_LAT, COL_LONG, COL_MERCH_LAT, COL_MERCH_LONG];

/// Numeric columns declared INTEGER in the warehouse. Encoded columns are
/// INTEGER too; anything else is TEXT.
pub const INTEGER_COLUMNS: &[&str] = &[
    COL_ZIP,
    COL_CITY_POP,
    COL_UNIX_TIME,
    COL_IS_FRAUD,
    COL_TRANS_MONTH,
    COL_TRANS_DAY,
    COL_TRANS_HOUR,
    COL_AGE,
];

/// Columns the transformer adds to every batch.
pub const DERIVED_COLUMNS: &[&str] = &[
    COL_TRANS_MONTH,
    COL_TRANS_DAY,
    COL_TRANS_HOUR,
    COL_AGE,
    COL_RECORD_KEY,
];

pub fn to_owned_list(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|c| c.to_string()).collect()
}
