// Reference repositories. Each one runs on a `TenantSession` and never
// names a namespace itself.
pub mod encounters;
pub mod patients;
