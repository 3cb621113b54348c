pub mod domain;
pub mod policy;
pub mod ports;
pub mod slots;
pub mod status;

pub use domain::{
    Availability, AuthSession, CalendarEvent, Client, ClientPackage, ClientPackageStatus,
    NewClient, NewPayment, NewSession, NewSlotLock, Package, PackageUse, Payment, PaymentStatus,
    Psychologist, Role, Session, SessionStatus, SlotLock, SlotLockStatus, User, UserCredentials,
};
pub use ports::{
    CalendarService, Clock, DatabaseService, GatewayCallback, NotificationSender, Outbox,
    PaymentGateway, PortError, PortResult, SettleOutcome, SideEffect, SystemClock,
};
