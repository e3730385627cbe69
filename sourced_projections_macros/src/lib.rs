mod document;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(Document)]
// ============================================================================

/// Derive macro for the `Document` trait.
///
/// Provides the storage collection name and, optionally, the reset hook that
/// the document worker calls right after a successful persist.
///
/// # Usage
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, Document)]
/// #[document(collection = "page_views", reset = clear_window)]
/// struct PageViews {
///     total: u64,
///     in_window: u64,
/// }
///
/// impl PageViews {
///     fn clear_window(self) -> Self {
///         Self { in_window: 0, ..self }
///     }
/// }
/// ```
///
/// Without `collection`, the snake_case struct name plus `s` is used
/// (`PageViews` becomes `page_viewss`, so naming it explicitly is usually nicer).
/// Without `reset`, the trait's no-op default applies.
#[proc_macro_derive(Document, attributes(document))]
pub fn derive_document(input: TokenStream) -> TokenStream {
    document::derive_document(input)
}
