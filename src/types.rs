/// Base name of an archive member without its extension.
/// Example: `000123456`
pub type OriginalName = String;
/// Zero-padded sequential identifier assigned to a committed sample.
/// Examples: `0000042` (training layout), `00000041` (validation layout)
pub type CanonicalId = String;
/// Path relative to a canonical folder root.
/// Example: `000000/0000042.jpg`
pub type RelativePath = String;
/// Identifier of a logical dataset feeding the sampler.
/// Examples: `cc3m`, `midjourney`
pub type SourceKey = String;
/// Example type tag used to route records to collate functions.
/// Examples: `text2image`, `image2text`
pub type TypeKey = String;
/// Caption text attached to an image.
/// Example: `a dog running on the beach`
pub type Caption = String;
/// Token id produced by the tokenizer collaborator.
pub type TokenId = u32;
