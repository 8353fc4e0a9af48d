mod job;
mod rows;

pub use job::{compose_prompt, sanitize_file_name, GenerationJobConfig};
pub use rows::{
    default_filename_column, default_prompt_column, Catalog, CellValue, ColumnSet, RowRecord,
};
