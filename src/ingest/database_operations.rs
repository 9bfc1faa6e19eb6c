//! Row inserts used by the record transaction.
//!
//! Both functions run on whatever connection they are given; the caller
//! decides whether that is a transaction or a savepoint inside one.

use crate::models::{Address, User};
use sqlx::PgConnection;

/// Insert the user row itself. Addresses are not touched.
pub async fn insert_user(conn: &mut PgConnection, user: &User) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO users (id, name, email, phone_number) VALUES ($1, $2, $3, $4)")
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.phone_number)
        .execute(&mut *conn)
        .await?;

    log::trace!("inserted user {}", user.id);
    Ok(())
}

/// Insert one address row. `address.user_id` must already point at its owner.
pub async fn insert_address(conn: &mut PgConnection, address: &Address) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO addresses (user_id, street, city, state, zip_code, country)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(&address.user_id)
    .bind(&address.street)
    .bind(&address.city)
    .bind(&address.state)
    .bind(&address.zip_code)
    .bind(&address.country)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
