pub mod calendar;
pub mod db;
pub mod email;
pub mod memory;
pub mod payu;
pub mod whatsapp;

pub use calendar::GoogleCalendarAdapter;
pub use db::DbAdapter;
pub use email::SmtpEmailAdapter;
pub use memory::InMemoryDatabase;
pub use payu::PayuGateway;
pub use whatsapp::WhatsAppAdapter;
