pub mod descriptor;
pub mod restore_record;
pub mod schedule;
