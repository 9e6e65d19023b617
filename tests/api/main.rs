mod health_check;
mod helpers;
mod postgres;
mod unsubscribe;
mod worker;
