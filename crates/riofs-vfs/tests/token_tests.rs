//! Cross-request tokens driven through the dispatcher: rename and link
//! against a token-named destination parent.

mod common;

use common::{open, rpc, serve_root};
use riofs_proto::{
    Handle, IOCTL_GET_TOKEN, OpCode, OpenFlags, Request, Token, VfsError,
};
use riofs_vfs::memfs;

async fn get_token(conn: &riofs_proto::Channel) -> Token {
    let mut reply = rpc(conn, Request::ioctl(IOCTL_GET_TOKEN, 0, Vec::new(), Vec::new())).await;
    assert_eq!(reply.status, Ok(()));
    let Some(Handle::Token(token)) = reply.handles.pop() else {
        panic!("expected a token handle");
    };
    token
}

#[tokio::test]
async fn rename_across_connections() {
    let root = memfs::root();
    let src = memfs::mkdir(&root, "src").unwrap();
    let dst = memfs::mkdir(&root, "dst").unwrap();
    memfs::put_file(&src, "f", b"x").unwrap();
    let (_vfs, conn) = serve_root(&root);

    let src_conn = open(&conn, "src", OpenFlags::DIRECTORY, 0).await.unwrap();
    let dst_conn = open(&conn, "dst", OpenFlags::DIRECTORY, 0).await.unwrap();

    let token = get_token(&dst_conn).await;
    let reply = rpc(
        &src_conn,
        Request::rename_or_link(OpCode::Rename, "f", "g", token),
    )
    .await;
    assert_eq!(reply.status, Ok(()));
    assert!(memfs::resolve(&src, "f").is_err());
    assert!(memfs::resolve(&dst, "g").is_ok());

    // One use consumed the token.
    let reply = rpc(
        &src_conn,
        Request::rename_or_link(OpCode::Rename, "g", "h", token),
    )
    .await;
    assert_eq!(reply.status, Err(VfsError::InvalidArgument));
}

#[tokio::test]
async fn closing_the_issuer_invalidates_the_token() {
    let root = memfs::root();
    let src = memfs::mkdir(&root, "src").unwrap();
    memfs::mkdir(&root, "dst").unwrap();
    memfs::put_file(&src, "f", b"x").unwrap();
    let (_vfs, conn) = serve_root(&root);

    let src_conn = open(&conn, "src", OpenFlags::DIRECTORY, 0).await.unwrap();
    let dst_conn = open(&conn, "dst", OpenFlags::DIRECTORY, 0).await.unwrap();

    let token = get_token(&dst_conn).await;
    rpc(&dst_conn, Request::new(OpCode::Close)).await;

    let reply = rpc(
        &src_conn,
        Request::rename_or_link(OpCode::Rename, "f", "g", token),
    )
    .await;
    assert_eq!(reply.status, Err(VfsError::InvalidArgument));
    // Nothing moved.
    assert!(memfs::resolve(&src, "f").is_ok());
}

#[tokio::test]
async fn repeated_token_requests_return_the_same_token() {
    let root = memfs::root();
    let (_vfs, conn) = serve_root(&root);
    let first = get_token(&conn).await;
    let second = get_token(&conn).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn link_rejects_directory_intent_but_still_consumes() {
    let root = memfs::root();
    memfs::put_file(&root, "f", b"x").unwrap();
    let (_vfs, conn) = serve_root(&root);

    let token = get_token(&conn).await;
    let reply = rpc(
        &conn,
        Request::rename_or_link(OpCode::Link, "f/", "g", token),
    )
    .await;
    assert_eq!(reply.status, Err(VfsError::NotADirectory));

    // The failed attempt burned the token.
    let reply = rpc(
        &conn,
        Request::rename_or_link(OpCode::Link, "f", "g", token),
    )
    .await;
    assert_eq!(reply.status, Err(VfsError::InvalidArgument));
}

#[tokio::test]
async fn link_creates_a_second_entry() {
    let root = memfs::root();
    memfs::put_file(&root, "f", b"shared").unwrap();
    let (_vfs, conn) = serve_root(&root);

    let token = get_token(&conn).await;
    let reply = rpc(
        &conn,
        Request::rename_or_link(OpCode::Link, "f", "g", token),
    )
    .await;
    assert_eq!(reply.status, Ok(()));

    let f = memfs::resolve(&root, "f").unwrap();
    let g = memfs::resolve(&root, "g").unwrap();
    assert!(std::sync::Arc::ptr_eq(&f, &g));
}

#[tokio::test]
async fn never_issued_token_rejected() {
    let root = memfs::root();
    memfs::put_file(&root, "f", b"x").unwrap();
    let (_vfs, conn) = serve_root(&root);

    let reply = rpc(
        &conn,
        Request::rename_or_link(OpCode::Rename, "f", "g", Token::from_raw(999)),
    )
    .await;
    assert_eq!(reply.status, Err(VfsError::InvalidArgument));
}
