mod chunk_test;
mod data_util_test;
mod file_store_test;
mod free_space_test;
mod position_test;
