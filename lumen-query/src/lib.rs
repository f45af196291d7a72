pub mod filter;
pub mod rls;
pub mod drill;
pub mod mongo;

pub use filter::{inject_where_clause, FilterService, QueryRunner, SqlStatement};
pub use rls::{RlsFilterResponse, RlsService};
pub use drill::DrillService;
pub use mongo::MongoTransformService;
